use crate::types::{ImageId, InstanceId, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Mount point of the boot/root device. Always present in an image's device
/// mappings and never offered to callers as an attachable mount point.
pub const ROOT_MOUNT_POINT: &str = "/";

/// Compiler family whose boot descriptor accepts run-time env injection.
pub const RUMP_COMPILER: &str = "rump";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Stopped,
    Pending,
    Unknown,
    Terminated,
    Error,
    Paused,
    Suspended,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Pending => "pending",
            InstanceState::Unknown => "unknown",
            InstanceState::Terminated => "terminated",
            InstanceState::Error => "error",
            InstanceState::Paused => "paused",
            InstanceState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Infrastructure {
    Aws,
    Gcloud,
    Vsphere,
    Virtualbox,
    Qemu,
    Photon,
    Xen,
    Openstack,
    Ukvm,
    Firecracker,
    Mock,
}

impl fmt::Display for Infrastructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Infrastructure::Aws => "AWS",
            Infrastructure::Gcloud => "GCLOUD",
            Infrastructure::Vsphere => "VSPHERE",
            Infrastructure::Virtualbox => "VIRTUALBOX",
            Infrastructure::Qemu => "QEMU",
            Infrastructure::Photon => "PHOTON",
            Infrastructure::Xen => "XEN",
            Infrastructure::Openstack => "OPENSTACK",
            Infrastructure::Ukvm => "UKVM",
            Infrastructure::Firecracker => "FIRECRACKER",
            Infrastructure::Mock => "MOCK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
    Vhd,
    Vmdk,
    Folder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum XenVirtualizationType {
    Hvm,
    Paravirtual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageDriver {
    Scsi,
    Sata,
    Ide,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VsphereNetworkType {
    E1000,
    Vmxnet3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct StageSpec {
    pub image_format: ImageFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xen_virtualization_type: Option<XenVirtualizationType>,
}

/// Compile-time binding of a logical mount point to a device identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMapping {
    pub mount_point: String,
    pub device_name: String,
}

impl DeviceMapping {
    pub fn new(mount_point: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            device_name: device_name.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.mount_point == ROOT_MOUNT_POINT
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RunSpec {
    #[serde(default)]
    pub device_mappings: Vec<DeviceMapping>,
    /// In MB.
    #[serde(default)]
    pub default_instance_memory: u32,
    #[serde(default, rename = "MinInstanceDiskMB")]
    pub min_instance_disk_mb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_driver: Option<StorageDriver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_network_type: Option<VsphereNetworkType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compiler: String,
}

impl RunSpec {
    /// Non-root mount points in declaration order.
    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.device_mappings
            .iter()
            .filter(|m| !m.is_root())
            .map(|m| m.mount_point.as_str())
    }

    pub fn mapping_for(&self, mount_point: &str) -> Option<&DeviceMapping> {
        self.device_mappings
            .iter()
            .find(|m| m.mount_point == mount_point)
    }

    /// Whether the image boots through a rump-style descriptor that accepts
    /// run-time env entries.
    pub fn is_rump(&self) -> bool {
        self.compiler == RUMP_COMPILER || self.compiler.starts_with("rump-")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub size_mb: u64,
    pub infrastructure: Infrastructure,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub stage_spec: StageSpec,
    #[serde(default)]
    pub run_spec: RunSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    #[serde(default)]
    pub ip_address: String,
    pub image_id: ImageId,
    pub infrastructure: Infrastructure,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size_mb: u64,
    /// Instance this volume is attached to, if any.
    #[serde(default)]
    pub attachment: Option<InstanceId>,
    /// Mount point the attachment is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    pub infrastructure: Infrastructure,
    pub created: DateTime<Utc>,
}

impl Volume {
    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn is_attached_to(&self, instance_id: &str) -> bool {
        self.attachment.as_deref() == Some(instance_id)
    }

    pub fn attach(&mut self, instance_id: InstanceId, mount_point: &str) {
        self.attachment = Some(instance_id);
        self.mount_point = Some(mount_point.to_owned());
    }

    pub fn detach(&mut self) {
        self.attachment = None;
        self.mount_point = None;
    }
}

/// Output of a compiler: a local disk image plus the specs the backend
/// needs to stage it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawImage {
    pub local_image_path: PathBuf,
    #[serde(default)]
    pub stage_spec: StageSpec,
    #[serde(default)]
    pub run_spec: RunSpec,
}
