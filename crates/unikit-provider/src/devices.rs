//! Compile-time block device numbering for rump-family targets.
//!
//! The boot/root device always takes slot 0. Each declared data mount point
//! takes the next slot in declaration order:
//!
//! | target | root mapping    | boot block            | data slot N        |
//! |--------|-----------------|-----------------------|--------------------|
//! | qemu   | `ld0e`          | `/dev/ld0e`           | `ld{N}a`           |
//! | vmware | `sd0`           | `/dev/sd0e`           | `sd{N}a`           |
//! | xen    | `/dev/sda1`     | etfs `sda1`           | `/dev/sd{a+N}1`    |
//!
//! The device names recorded here end up in `RunSpec.device_mappings` and are
//! the single source of truth for attachment order at run time.

use crate::bootconfig::{Block, NetConfig};
use crate::ProviderError;
use std::collections::HashSet;
use unikit_schema::{DeviceMapping, ROOT_MOUNT_POINT};

const BOOT_MOUNT_POINT: &str = "/bootpart";

/// Highest data slot a letter-addressed device can take (`sdz1`).
const MAX_LETTER_SLOT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RumpTarget {
    Qemu,
    Vmware,
    Xen,
}

impl RumpTarget {
    pub fn root_mapping(self) -> DeviceMapping {
        match self {
            RumpTarget::Qemu => DeviceMapping::new(ROOT_MOUNT_POINT, "ld0e"),
            RumpTarget::Vmware => DeviceMapping::new(ROOT_MOUNT_POINT, "sd0"),
            RumpTarget::Xen => DeviceMapping::new(ROOT_MOUNT_POINT, "/dev/sda1"),
        }
    }

    pub fn boot_block(self) -> Block {
        match self {
            RumpTarget::Qemu => Block::dev("/dev/ld0e", BOOT_MOUNT_POINT),
            // No disk label on the boot partition, so partition e is used.
            RumpTarget::Vmware => Block::dev("/dev/sd0e", BOOT_MOUNT_POINT),
            RumpTarget::Xen => Block::etfs("sda1", BOOT_MOUNT_POINT),
        }
    }

    /// Device name recorded in the image's mappings for data slot `slot` (1-based).
    pub fn data_device(self, slot: usize) -> Result<String, ProviderError> {
        match self {
            RumpTarget::Qemu => Ok(format!("ld{slot}a")),
            RumpTarget::Vmware => Ok(format!("sd{slot}a")),
            RumpTarget::Xen => Ok(format!("/dev/{}", xen_disk(slot)?)),
        }
    }

    fn data_block(self, slot: usize, mount_point: &str) -> Result<Block, ProviderError> {
        match self {
            RumpTarget::Qemu | RumpTarget::Vmware => Ok(Block::dev(
                &format!("/dev/{}", self.data_device(slot)?),
                mount_point,
            )),
            RumpTarget::Xen => Ok(Block::etfs(&xen_disk(slot)?, mount_point)),
        }
    }

    pub fn network(self) -> NetConfig {
        match self {
            RumpTarget::Qemu => NetConfig::dhcp("vioif0"),
            RumpTarget::Vmware => NetConfig::dhcp("wm0"),
            RumpTarget::Xen => NetConfig::dhcp("xenif0").with_cloner(),
        }
    }

    /// In MB.
    pub fn default_memory(self) -> u32 {
        match self {
            RumpTarget::Qemu => 512,
            RumpTarget::Vmware => 256,
            RumpTarget::Xen => 1024,
        }
    }
}

fn xen_disk(slot: usize) -> Result<String, ProviderError> {
    if slot > MAX_LETTER_SLOT {
        return Err(ProviderError::InvalidParams(format!(
            "xen images support at most {MAX_LETTER_SLOT} data volumes"
        )));
    }
    let letter = char::from(b'a' + slot as u8);
    Ok(format!("sd{letter}1"))
}

/// Assign devices to `mount_points` in declaration order.
///
/// Returns the image's device mappings (root first) and the boot descriptor
/// block entries (boot partition first).
pub fn number_devices<S: AsRef<str>>(
    target: RumpTarget,
    mount_points: &[S],
) -> Result<(Vec<DeviceMapping>, Vec<Block>), ProviderError> {
    let mut mappings = vec![target.root_mapping()];
    let mut blocks = vec![target.boot_block()];
    let mut seen = HashSet::new();

    for (i, mount_point) in mount_points.iter().enumerate() {
        let mount_point = mount_point.as_ref();
        if !mount_point.starts_with('/') || mount_point == ROOT_MOUNT_POINT {
            return Err(ProviderError::InvalidParams(format!(
                "mount point '{mount_point}' must be an absolute, non-root path"
            )));
        }
        if !seen.insert(mount_point) {
            return Err(ProviderError::InvalidParams(format!(
                "mount point '{mount_point}' declared twice"
            )));
        }
        let slot = i + 1;
        let device = target.data_device(slot)?;
        tracing::debug!("adding mount point to image: {mount_point}:{device}");
        mappings.push(DeviceMapping::new(mount_point, device));
        blocks.push(target.data_block(slot, mount_point)?);
    }
    Ok((mappings, blocks))
}

/// Numeric controller slot encoded in a device name.
///
/// Accepts both digit-addressed (`ld1a`, `sd0`, `/dev/sd2a`) and
/// letter-addressed (`sdb1`, `/dev/xvdc`) names.
pub fn controller_port(device_name: &str) -> Result<usize, ProviderError> {
    let invalid = || ProviderError::InvalidDeviceName(device_name.to_owned());
    let bare = device_name.strip_prefix("/dev/").unwrap_or(device_name);

    let prefix_len = bare
        .find(|c: char| !c.is_ascii_lowercase())
        .unwrap_or(bare.len());

    match prefix_len {
        // Digit-addressed: `ld1a`, `sd0`.
        2 => {
            let digits: String = bare[2..].chars().take_while(char::is_ascii_digit).collect();
            digits.parse().map_err(|_| invalid())
        }
        // Letter-addressed: the last letter of the run is the slot, `sdb1`, `xvdc`.
        n if n >= 3 => {
            let letter = bare.as_bytes()[n - 1];
            Ok(usize::from(letter - b'a'))
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(target: RumpTarget, mounts: &[&str]) -> Vec<String> {
        number_devices(target, mounts)
            .unwrap()
            .0
            .into_iter()
            .map(|m| m.device_name)
            .collect()
    }

    #[test]
    fn qemu_numbering() {
        assert_eq!(
            devices(RumpTarget::Qemu, &["/data", "/logs"]),
            vec!["ld0e", "ld1a", "ld2a"]
        );
    }

    #[test]
    fn vmware_numbering() {
        assert_eq!(
            devices(RumpTarget::Vmware, &["/data"]),
            vec!["sd0", "sd1a"]
        );
    }

    #[test]
    fn xen_numbering() {
        assert_eq!(
            devices(RumpTarget::Xen, &["/data", "/logs"]),
            vec!["/dev/sda1", "/dev/sdb1", "/dev/sdc1"]
        );
    }

    #[test]
    fn numbering_follows_declaration_order() {
        let (mappings, _) = number_devices(RumpTarget::Qemu, &["/z", "/a"]).unwrap();
        assert_eq!(mappings[1].mount_point, "/z");
        assert_eq!(mappings[2].mount_point, "/a");
    }

    #[test]
    fn double_digit_slots() {
        let mounts: Vec<String> = (0..11).map(|i| format!("/m{i}")).collect();
        let (mappings, _) = number_devices(RumpTarget::Qemu, &mounts).unwrap();
        assert_eq!(mappings[11].device_name, "ld11a");
        assert_eq!(controller_port(&mappings[11].device_name).unwrap(), 11);
    }

    #[test]
    fn blocks_match_mappings() {
        let (_, blocks) = number_devices(RumpTarget::Xen, &["/data"]).unwrap();
        assert_eq!(blocks[0].source, "etfs");
        assert_eq!(blocks[0].path, "sda1");
        assert_eq!(blocks[0].mountpoint, "/bootpart");
        assert_eq!(blocks[1].path, "sdb1");
        assert_eq!(blocks[1].mountpoint, "/data");

        let (_, blocks) = number_devices(RumpTarget::Qemu, &["/data"]).unwrap();
        assert_eq!(blocks[1].source, "dev");
        assert_eq!(blocks[1].path, "/dev/ld1a");
    }

    #[test]
    fn invalid_mount_points_rejected() {
        assert!(number_devices(RumpTarget::Qemu, &["/"]).is_err());
        assert!(number_devices(RumpTarget::Qemu, &["data"]).is_err());
        assert!(number_devices(RumpTarget::Qemu, &["/data", "/data"]).is_err());
    }

    #[test]
    fn xen_slot_limit() {
        let mounts: Vec<String> = (0..26).map(|i| format!("/m{i}")).collect();
        assert!(number_devices(RumpTarget::Xen, &mounts).is_err());
        assert!(number_devices(RumpTarget::Xen, &mounts[..25]).is_ok());
    }

    #[test]
    fn controller_ports() {
        assert_eq!(controller_port("ld0e").unwrap(), 0);
        assert_eq!(controller_port("ld3a").unwrap(), 3);
        assert_eq!(controller_port("sd0").unwrap(), 0);
        assert_eq!(controller_port("/dev/sd2a").unwrap(), 2);
        assert_eq!(controller_port("/dev/sda1").unwrap(), 0);
        assert_eq!(controller_port("/dev/sdc1").unwrap(), 2);
        assert_eq!(controller_port("xvdb").unwrap(), 1);
    }

    #[test]
    fn bad_device_names() {
        assert!(controller_port("").is_err());
        assert!(controller_port("/dev/").is_err());
        assert!(controller_port("x1").is_err());
        assert!(controller_port("sd").is_err());
    }
}
