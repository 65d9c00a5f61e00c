//! Backend registry: provider names mapped to constructed providers.

use crate::CoreError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use unikit_provider::{MockAuthority, MockProvider, Provider, ProviderError, QemuProvider};
use unikit_schema::DaemonConfig;

#[derive(Default, Clone)]
pub struct Providers {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct every provider `config` declares under its home directory.
    ///
    /// Each mock provider gets its own in-memory authority.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let home = config.home_dir()?;
        Self::from_config_in(config, &home)
    }

    fn from_config_in(config: &DaemonConfig, home: &Path) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for qemu in &config.providers.qemu {
            registry.insert(Arc::new(QemuProvider::new(qemu.clone(), home)?))?;
        }
        for mock in &config.providers.mock {
            let authority = Arc::new(MockAuthority::new());
            registry.insert(Arc::new(MockProvider::new(mock, home, authority)?))?;
        }
        info!(
            home = %home.display(),
            providers = ?registry.names(),
            "provider registry ready"
        );
        Ok(registry)
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) -> Result<(), CoreError> {
        let name = provider.name().to_owned();
        if self.providers.contains_key(&name) {
            return Err(CoreError::DuplicateProvider(name));
        }
        debug!("registering provider {name}");
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Provider>)> {
        self.providers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, CoreError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownProvider(name.to_owned()))
    }

    /// The named provider, or the only one when no name is given.
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn Provider>, CoreError> {
        if let Some(name) = name {
            return self.get(name);
        }
        let mut all = self.providers.values();
        match (all.next(), all.next()) {
            (None, _) => Err(CoreError::NoProviders),
            (Some(only), None) => Ok(Arc::clone(only)),
            (Some(_), Some(_)) => Err(CoreError::ProviderRequired {
                count: self.providers.len(),
                names: self.names().join(", "),
            }),
        }
    }

    /// First provider, in name order, that knows the image.
    pub fn provider_for_image(&self, name_or_id: &str) -> Result<Arc<dyn Provider>, CoreError> {
        self.find_owner("image", name_or_id, |p| p.get_image(name_or_id).map(|_| ()))
    }

    pub fn provider_for_instance(
        &self,
        name_or_id: &str,
    ) -> Result<Arc<dyn Provider>, CoreError> {
        self.find_owner("instance", name_or_id, |p| {
            p.get_instance(name_or_id).map(|_| ())
        })
    }

    pub fn provider_for_volume(&self, name_or_id: &str) -> Result<Arc<dyn Provider>, CoreError> {
        self.find_owner("volume", name_or_id, |p| p.get_volume(name_or_id).map(|_| ()))
    }

    fn find_owner<F>(
        &self,
        kind: &'static str,
        query: &str,
        lookup: F,
    ) -> Result<Arc<dyn Provider>, CoreError>
    where
        F: Fn(&dyn Provider) -> Result<(), ProviderError>,
    {
        for (name, provider) in &self.providers {
            match lookup(provider.as_ref()) {
                Ok(()) => {
                    debug!("{kind} {query} belongs to provider {name}");
                    return Ok(Arc::clone(provider));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProviderError::NotFound {
            kind,
            query: query.to_owned(),
        }
        .into())
    }
}
