//! Resource model, request shapes, and daemon configuration for unikit.
//!
//! This crate defines the schema layer shared by every backend: the three
//! resource kinds (`Image`, `Instance`, `Volume`) and their compile/run specs,
//! typed identifiers, the uniform request parameters providers accept, the
//! CLI binding parsers, and the TOML daemon configuration.

pub mod config;
pub mod params;
pub mod resource;
pub mod types;

pub use config::{
    default_home, ConfigError, DaemonConfig, HubConfig, MockConfig, ProvidersSection, QemuConfig,
};
pub use params::{
    parse_env_pairs, parse_volume_bindings, CreateVolumeParams, ParamsError, PullImageParams,
    PushImageParams, RemoteDeleteImageParams, RunInstanceParams, StageImageParams,
};
pub use resource::{
    DeviceMapping, Image, ImageFormat, Infrastructure, Instance, InstanceState, RawImage, RunSpec,
    StageSpec, StorageDriver, Volume, VsphereNetworkType, XenVirtualizationType, ROOT_MOUNT_POINT,
    RUMP_COMPILER,
};
pub use types::{ImageId, InstanceId, VolumeId};
