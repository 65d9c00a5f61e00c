pub mod completions;
pub mod daemon;
pub mod hub;
pub mod images;
pub mod instances;
pub mod man_pages;
pub mod providers;
pub mod volumes;

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use unikit_core::{CoreError, Providers};
use unikit_provider::{Provider, RumpTarget};
use unikit_schema::{DaemonConfig, HubConfig, ImageFormat};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_NOT_FOUND: u8 = 3;

/// Everything a command needs: the loaded config, the provider registry,
/// and the global flags.
pub struct App {
    config: DaemonConfig,
    registry: Providers,
    provider: Option<String>,
    pub json: bool,
}

/// Hub settings given on the command line, layered over `[hub]`.
#[derive(Debug, Default)]
pub struct HubOverrides {
    pub url: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl App {
    pub fn load(config_path: Option<&Path>, provider: Option<String>, json: bool) -> Result<Self, String> {
        let config = match config_path {
            Some(path) => DaemonConfig::load(path),
            None => DaemonConfig::load_default(),
        }
        .map_err(|e| format!("config error: {e}"))?;
        let registry = Providers::from_config(&config).map_err(|e| e.to_string())?;
        Ok(Self::new(config, registry, provider, json))
    }

    pub fn new(
        config: DaemonConfig,
        registry: Providers,
        provider: Option<String>,
        json: bool,
    ) -> Self {
        Self {
            config,
            registry,
            provider,
            json,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Providers {
        &self.registry
    }

    /// Provider for commands that create something: `--provider`, or the
    /// only configured one.
    pub fn target(&self) -> Result<Arc<dyn Provider>, String> {
        self.registry
            .select(self.provider.as_deref())
            .map_err(|e| e.to_string())
    }

    /// Providers a listing covers: `--provider` alone, or all of them.
    pub fn scope(&self) -> Result<Vec<Arc<dyn Provider>>, String> {
        match &self.provider {
            Some(name) => Ok(vec![self.registry.get(name).map_err(|e| e.to_string())?]),
            None => Ok(self.registry.iter().map(|(_, p)| Arc::clone(p)).collect()),
        }
    }

    pub fn image_owner(&self, query: &str) -> Result<Arc<dyn Provider>, String> {
        self.owner(query, Providers::provider_for_image)
    }

    pub fn instance_owner(&self, query: &str) -> Result<Arc<dyn Provider>, String> {
        self.owner(query, Providers::provider_for_instance)
    }

    pub fn volume_owner(&self, query: &str) -> Result<Arc<dyn Provider>, String> {
        self.owner(query, Providers::provider_for_volume)
    }

    fn owner(
        &self,
        query: &str,
        find: fn(&Providers, &str) -> Result<Arc<dyn Provider>, CoreError>,
    ) -> Result<Arc<dyn Provider>, String> {
        match &self.provider {
            Some(name) => self.registry.get(name).map_err(|e| e.to_string()),
            None => find(&self.registry, query).map_err(|e| e.to_string()),
        }
    }

    pub fn hub_config(&self, overrides: HubOverrides) -> Result<HubConfig, String> {
        let mut hub = self.config.hub.clone().unwrap_or_default();
        if let Some(url) = overrides.url {
            hub.url = url;
        }
        if let Some(user) = overrides.user {
            hub.user = user;
        }
        if let Some(pass) = overrides.pass {
            hub.pass = pass;
        }
        if hub.url.is_empty() {
            return Err("config error: no hub url; set [hub] url or pass --hub-url".to_owned());
        }
        Ok(hub)
    }

    /// Run `list` against every provider in scope, keyed by provider name.
    pub fn collect<T>(
        &self,
        list: impl Fn(&dyn Provider) -> Result<Vec<T>, unikit_provider::ProviderError>,
    ) -> Result<BTreeMap<String, Vec<T>>, String> {
        let mut out = BTreeMap::new();
        for provider in self.scope()? {
            let items = list(provider.as_ref())
                .map_err(|e| format!("{}: {e}", provider.name()))?;
            out.insert(provider.name().to_owned(), items);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RumpArg {
    Qemu,
    Vmware,
    Xen,
}

impl From<RumpArg> for RumpTarget {
    fn from(arg: RumpArg) -> Self {
        match arg {
            RumpArg::Qemu => RumpTarget::Qemu,
            RumpArg::Vmware => RumpTarget::Vmware,
            RumpArg::Xen => RumpTarget::Xen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FormatArg {
    Raw,
    Qcow2,
    Vhd,
    Vmdk,
    Folder,
}

impl From<FormatArg> for ImageFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Raw => ImageFormat::Raw,
            FormatArg::Qcow2 => ImageFormat::Qcow2,
            FormatArg::Vhd => ImageFormat::Vhd,
            FormatArg::Vmdk => ImageFormat::Vmdk,
            FormatArg::Folder => ImageFormat::Folder,
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` behind a spinner unless JSON output was requested.
pub fn with_spinner<T>(
    json: bool,
    msg: &str,
    done: impl FnOnce(&T) -> String,
    op: impl FnOnce() -> Result<T, String>,
) -> Result<T, String> {
    if json {
        return op();
    }
    let pb = spinner(msg);
    match op() {
        Ok(value) => {
            spin_ok(&pb, &done(&value));
            Ok(value)
        }
        Err(e) => {
            spin_fail(&pb, msg);
            Err(e)
        }
    }
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().green().bold().apply_to(state).to_string(),
        "pending" => Style::new().yellow().apply_to(state).to_string(),
        "stopped" | "paused" | "suspended" => Style::new().blue().apply_to(state).to_string(),
        "error" => Style::new().red().bold().apply_to(state).to_string(),
        "terminated" | "unknown" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}
