//! Provider contract and shared orchestration logic for unikit backends.
//!
//! This crate implements the resource orchestration layer: the `Provider`
//! trait every backend satisfies, name-or-id lookup, the device mapping
//! resolver that binds mount points to block devices across compile and run
//! time, the rump boot descriptor assembler, instance-listener discovery,
//! bounded backoff waits, the image hub client, and two backends: `qemu`
//! (process-based VMM) and `mock` (a simulated cloud authority).

pub mod bootconfig;
pub mod devices;
pub mod hub;
pub mod listener;
pub mod lookup;
pub mod mock;
pub mod mounts;
pub mod provider;
pub mod qemu;
pub mod vmm;
pub mod wait;

pub use bootconfig::{assemble_rump, inject_env, BootConfig, RumpImage};
pub use devices::RumpTarget;
pub use hub::{HubClient, HubImage};
pub use listener::InstanceListener;
pub use lookup::{find_by_name_or_id, Resource};
pub use mock::{MockAuthority, MockProvider};
pub use mounts::{
    claim_mount_point, controller_port_for_mount, device_name_for_mount, ordered_volumes,
    verify_mounts_input, BoundVolume,
};
pub use provider::{Provider, ProviderConfig};
pub use qemu::QemuProvider;
pub use vmm::{LaunchSpec, ProcessDriver, VmmDriver};
pub use wait::Backoff;

use std::time::Duration;
use thiserror::Error;
use unikit_store::StoreError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("required mount point missing from input: {0}")]
    MissingMountPoint(String),
    #[error("mount point {mount_point} does not exist for image {image}")]
    UnknownMountPoint { mount_point: String, image: String },
    #[error("could not find volume {0}")]
    VolumeNotFound(String),
    #[error("invalid device name '{0}'")]
    InvalidDeviceName(String),
    #[error("{kind} with name '{name}' already exists")]
    NameConflict { kind: &'static str, name: String },
    #[error("volume {volume} is already attached to instance {instance}")]
    AlreadyAttached { volume: String, instance: String },
    #[error("instance {instance} already has volume {volume} at {mount_point}")]
    MountPointInUse {
        mount_point: String,
        instance: String,
        volume: String,
    },
    #[error("volume {0} is not attached")]
    NotAttached(String),
    #[error("image {image} is used by {count} instance(s); use force to delete it")]
    ImageInUse { image: String, count: usize },
    #[error("instance {0} is running; use force to delete it")]
    InstanceRunning(String),
    #[error("volume {volume} is attached to instance {instance}; use force to delete it")]
    VolumeInUse { volume: String, instance: String },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{kind} with name or id containing '{query}' not found")]
    NotFound { kind: &'static str, query: String },
    #[error("'{query}' matches more than one {kind}: {candidates}")]
    Ambiguous {
        kind: &'static str,
        query: String,
        candidates: String,
    },
    #[error("{op}: {message}")]
    Backend { op: String, message: String },
    #[error("no record of {kind} {id} in the state")]
    StateInconsistent { kind: &'static str, id: String },
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("{op} is not supported by the {backend} provider")]
    Unsupported { op: &'static str, backend: String },
    #[error("hub error: {0}")]
    Hub(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    pub fn backend(op: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ProviderError::Backend {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// The innermost error beneath any context layers.
    pub fn root(&self) -> &ProviderError {
        let mut current = self;
        while let ProviderError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ProviderError::NotFound { .. })
    }
}

/// Adds a human-readable context layer to a provider error.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ProviderError>;

    fn with_context<C, F>(self, f: F) -> Result<T, ProviderError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ProviderError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, ProviderError> {
        self.map_err(|e| ProviderError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T, ProviderError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| ProviderError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
