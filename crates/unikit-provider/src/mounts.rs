//! Run-time resolution of mount points against an image's compile-time
//! device mappings.

use crate::devices::controller_port;
use crate::ProviderError;
use std::collections::BTreeMap;
use unikit_schema::{Image, InstanceId, Volume};
use unikit_store::VolumeMap;

/// Check a mount point to volume binding against `image`.
///
/// Every bound mount point must be declared, every non-root mount point the
/// image declares must be bound, and every bound volume must resolve through
/// `resolve_volume`. Returns the bindings with their volumes resolved.
pub fn verify_mounts_input<F>(
    image: &Image,
    bindings: &BTreeMap<String, String>,
    mut resolve_volume: F,
) -> Result<BTreeMap<String, Volume>, ProviderError>
where
    F: FnMut(&str) -> Result<Volume, ProviderError>,
{
    for mount_point in bindings.keys() {
        let declared = image
            .run_spec
            .mount_points()
            .any(|declared| declared == mount_point);
        if !declared {
            return Err(ProviderError::UnknownMountPoint {
                mount_point: mount_point.clone(),
                image: image.id.to_string(),
            });
        }
    }
    for mount_point in image.run_spec.mount_points() {
        if !bindings.contains_key(mount_point) {
            tracing::error!(
                required = ?image.run_spec.device_mappings,
                "required mount point missing: {mount_point}"
            );
            return Err(ProviderError::MissingMountPoint(mount_point.to_owned()));
        }
    }

    let mut resolved = BTreeMap::new();
    for (mount_point, volume_id) in bindings {
        let volume = resolve_volume(volume_id).map_err(|e| {
            if e.is_not_found() {
                ProviderError::VolumeNotFound(volume_id.clone())
            } else {
                e
            }
        })?;
        resolved.insert(mount_point.clone(), volume);
    }
    Ok(resolved)
}

/// The device name bound to `mount_point` when the image was compiled.
pub fn device_name_for_mount(image: &Image, mount_point: &str) -> Result<String, ProviderError> {
    image
        .run_spec
        .mapping_for(mount_point)
        .map(|m| m.device_name.clone())
        .ok_or_else(|| ProviderError::UnknownMountPoint {
            mount_point: mount_point.to_owned(),
            image: image.id.to_string(),
        })
}

/// The controller slot the compiled kernel expects `mount_point` on.
pub fn controller_port_for_mount(image: &Image, mount_point: &str) -> Result<usize, ProviderError> {
    controller_port(&device_name_for_mount(image, mount_point)?)
}

/// Record `volume_id` as attached to `instance_id` at `mount_point` in a
/// ledger draft.
///
/// Fails when the volume is attached anywhere already, or when another
/// volume of the same instance holds the mount point.
pub fn claim_mount_point(
    volumes: &mut VolumeMap,
    volume_id: &str,
    instance_id: &InstanceId,
    mount_point: &str,
) -> Result<(), ProviderError> {
    if let Some(holder) = volumes.values().find(|v| {
        v.id != volume_id
            && v.is_attached_to(instance_id)
            && v.mount_point.as_deref() == Some(mount_point)
    }) {
        return Err(ProviderError::MountPointInUse {
            mount_point: mount_point.to_owned(),
            instance: instance_id.to_string(),
            volume: holder.id.to_string(),
        });
    }
    let record = volumes
        .get_mut(volume_id)
        .ok_or_else(|| ProviderError::StateInconsistent {
            kind: "volume",
            id: volume_id.to_owned(),
        })?;
    if let Some(owner) = &record.attachment {
        return Err(ProviderError::AlreadyAttached {
            volume: volume_id.to_owned(),
            instance: owner.to_string(),
        });
    }
    record.attach(instance_id.clone(), mount_point);
    Ok(())
}

/// A volume bound to one of an image's mount points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundVolume {
    pub port: usize,
    pub mount_point: String,
    pub volume: Volume,
}

/// Resolved volumes ordered by the controller slot of their mount point.
pub fn ordered_volumes(
    image: &Image,
    resolved: BTreeMap<String, Volume>,
) -> Result<Vec<BoundVolume>, ProviderError> {
    let mut ordered = resolved
        .into_iter()
        .map(|(mount_point, volume)| {
            controller_port_for_mount(image, &mount_point).map(|port| BoundVolume {
                port,
                mount_point,
                volume,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    ordered.sort_by_key(|bound| bound.port);
    Ok(ordered)
}
