use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read daemon config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse daemon config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to write daemon config: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("HOME not set")]
    NoHome,
    #[error("provider name must not be empty")]
    EmptyProviderName,
    #[error("provider name '{0}' is configured more than once")]
    DuplicateProvider(String),
}

/// Credentials and endpoint for the image hub.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QemuConfig {
    pub name: String,
    #[serde(default)]
    pub no_graphic: bool,
    #[serde(default = "default_debugger_port")]
    pub debugger_port: u16,
    #[serde(default = "default_qemu_binary")]
    pub qemu_binary: String,
    /// Listen for instances announcing their address after boot.
    #[serde(default)]
    pub discover_ips: bool,
}

impl QemuConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            no_graphic: false,
            debugger_port: default_debugger_port(),
            qemu_binary: default_qemu_binary(),
            discover_ips: false,
        }
    }
}

fn default_debugger_port() -> u16 {
    3001
}

fn default_qemu_binary() -> String {
    "qemu-system-x86_64".to_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "local-1".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProvidersSection {
    #[serde(default)]
    pub qemu: Vec<QemuConfig>,
    #[serde(default)]
    pub mock: Vec<MockConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// State root. Defaults to `~/.unikit`.
    #[serde(default)]
    pub home: Option<PathBuf>,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub hub: Option<HubConfig>,
}

impl DaemonConfig {
    /// Load `~/.unikit/daemon.toml`, falling back to defaults when it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_home()?.join("daemon.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let names = self
            .providers
            .qemu
            .iter()
            .map(|q| q.name.as_str())
            .chain(self.providers.mock.iter().map(|m| m.name.as_str()));
        for name in names {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyProviderName);
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateProvider(name.to_owned()));
            }
        }
        Ok(())
    }

    pub fn home_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => default_home(),
        }
    }
}

pub fn default_home() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
    Ok(PathBuf::from(home).join(".unikit"))
}
