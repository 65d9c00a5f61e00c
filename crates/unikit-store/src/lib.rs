//! Per-backend durable ledger for unikit.
//!
//! This crate provides the storage layer every provider composes: a
//! `StateStore` holding the image, instance, and volume maps behind
//! per-kind locks and persisting them as one JSON document, and a
//! `BackendLayout` describing where a backend keeps its state file and
//! resource artifacts.

pub mod layout;
pub mod state;

pub use layout::BackendLayout;
pub use state::{ImageMap, InstanceMap, StateStore, VolumeMap};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
