//! Request shapes accepted by every provider, and parsers for the
//! `volumeId:mountPoint` and `KEY=VALUE` bindings the front ends collect.

use crate::config::HubConfig;
use crate::resource::RawImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid volume binding '{0}': expected volumeId:mountPoint")]
    InvalidVolumeBinding(String),
    #[error("mount point '{0}' is bound more than once")]
    DuplicateMountPoint(String),
    #[error("'{0}' is an invalid env pair: expected KEY=VALUE")]
    InvalidEnvPair(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunInstanceParams {
    pub name: String,
    /// Name or id of the image to boot.
    pub image_id: String,
    /// Mount point to volume name-or-id.
    #[serde(default)]
    pub mount_points_to_volume_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// In MB; `0` means the image's default.
    #[serde(default)]
    pub instance_memory: u32,
    #[serde(default)]
    pub no_cleanup: bool,
    #[serde(default)]
    pub debug_mode: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageImageParams {
    pub name: String,
    pub raw_image: RawImage,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub no_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateVolumeParams {
    pub name: String,
    /// Raw data image to seed the volume from.
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    /// Size of an empty volume when no image is given.
    #[serde(default)]
    pub size_mb: Option<u64>,
    #[serde(default)]
    pub no_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullImageParams {
    pub config: HubConfig,
    pub image_name: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushImageParams {
    pub config: HubConfig,
    pub image_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteDeleteImageParams {
    pub config: HubConfig,
    pub image_name: String,
}

/// Parse `volumeId:mountPoint` pairs into a mount point to volume map.
///
/// Only the first `:` separates the pair, so a volume id may not contain one.
pub fn parse_volume_bindings<S: AsRef<str>>(
    bindings: &[S],
) -> Result<BTreeMap<String, String>, ParamsError> {
    let mut out = BTreeMap::new();
    for raw in bindings {
        let raw = raw.as_ref();
        let Some((volume, mount_point)) = raw.split_once(':') else {
            return Err(ParamsError::InvalidVolumeBinding(raw.to_owned()));
        };
        if volume.is_empty() || mount_point.is_empty() {
            return Err(ParamsError::InvalidVolumeBinding(raw.to_owned()));
        }
        if out
            .insert(mount_point.to_owned(), volume.to_owned())
            .is_some()
        {
            return Err(ParamsError::DuplicateMountPoint(mount_point.to_owned()));
        }
    }
    Ok(out)
}

/// Parse `KEY=VALUE` pairs. The first `=` ends the key; the value may
/// contain more of them.
pub fn parse_env_pairs<S: AsRef<str>>(
    pairs: &[S],
) -> Result<BTreeMap<String, String>, ParamsError> {
    let mut out = BTreeMap::new();
    for raw in pairs {
        let raw = raw.as_ref();
        match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                out.insert(key.to_owned(), value.to_owned());
            }
            _ => return Err(ParamsError::InvalidEnvPair(raw.to_owned())),
        }
    }
    Ok(out)
}
