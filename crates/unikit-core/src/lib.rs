//! Daemon-level wiring for unikit.
//!
//! This crate turns a `DaemonConfig` into a registry of constructed
//! providers, runs the background reconciliation loop that keeps each
//! backend's ledger in step with its authority, and owns process-wide
//! concerns: the single-daemon lock and Ctrl-C handling.

pub mod concurrency;
pub mod reconcile;
pub mod registry;

pub use concurrency::{install_signal_handler, shutdown_requested, DaemonLock};
pub use reconcile::{spawn_reconciler, ReconcilerHandle, DEFAULT_INTERVAL};
pub use registry::Providers;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] unikit_schema::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] unikit_store::StoreError),
    #[error(transparent)]
    Provider(#[from] unikit_provider::ProviderError),
    #[error("no provider named '{0}' is configured")]
    UnknownProvider(String),
    #[error("provider '{0}' is registered twice")]
    DuplicateProvider(String),
    #[error("no providers are configured")]
    NoProviders,
    #[error("{count} providers are configured; pick one with --provider ({names})")]
    ProviderRequired { count: usize, names: String },
    #[error("another daemon holds {0}")]
    DaemonRunning(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the underlying failure is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::Provider(e) if e.is_not_found())
    }
}
