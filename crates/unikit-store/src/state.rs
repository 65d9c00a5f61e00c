use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use unikit_schema::{Image, ImageId, Instance, InstanceId, Volume, VolumeId};

pub type ImageMap = HashMap<ImageId, Image>;
pub type InstanceMap = HashMap<InstanceId, Instance>;
pub type VolumeMap = HashMap<VolumeId, Volume>;

/// On-disk shape of the ledger: exactly the three maps, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct Ledger {
    #[serde(default, deserialize_with = "null_as_empty")]
    images: ImageMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    instances: InstanceMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    volumes: VolumeMap,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Per-backend durable ledger of images, instances, and volumes.
///
/// Each resource kind has its own reader/writer lock. Readers get deep
/// copies. Writers run their mutation against a draft of the live map and
/// the full ledger is rewritten atomically before the draft is committed,
/// so a failed mutation or a failed write leaves both memory and disk
/// untouched.
///
/// The write itself is serialized by a separate mutex that owns the last
/// persisted ledger. Writers of one kind never take another kind's lock,
/// so reads of one kind are not blocked by a write of another.
pub struct StateStore {
    path: PathBuf,
    images: RwLock<ImageMap>,
    instances: RwLock<InstanceMap>,
    volumes: RwLock<VolumeMap>,
    persisted: Mutex<Ledger>,
}

impl StateStore {
    /// Open the ledger at `path`. A missing file yields an empty ledger;
    /// nothing is written until the first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let ledger = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Ledger::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Ledger::default()
        };
        debug!(
            path = %path.display(),
            images = ledger.images.len(),
            instances = ledger.instances.len(),
            volumes = ledger.volumes.len(),
            "loaded state"
        );
        Ok(Self {
            path,
            images: RwLock::new(ledger.images.clone()),
            instances: RwLock::new(ledger.instances.clone()),
            volumes: RwLock::new(ledger.volumes.clone()),
            persisted: Mutex::new(ledger),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn images(&self) -> Result<ImageMap, StoreError> {
        Ok(self
            .images
            .read()
            .map_err(|e| StoreError::LockFailed(format!("images: {e}")))?
            .clone())
    }

    pub fn instances(&self) -> Result<InstanceMap, StoreError> {
        Ok(self
            .instances
            .read()
            .map_err(|e| StoreError::LockFailed(format!("instances: {e}")))?
            .clone())
    }

    pub fn volumes(&self) -> Result<VolumeMap, StoreError> {
        Ok(self
            .volumes
            .read()
            .map_err(|e| StoreError::LockFailed(format!("volumes: {e}")))?
            .clone())
    }

    pub fn image(&self, id: &str) -> Result<Option<Image>, StoreError> {
        Ok(self
            .images
            .read()
            .map_err(|e| StoreError::LockFailed(format!("images: {e}")))?
            .get(id)
            .cloned())
    }

    pub fn instance(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .instances
            .read()
            .map_err(|e| StoreError::LockFailed(format!("instances: {e}")))?
            .get(id)
            .cloned())
    }

    pub fn volume(&self, id: &str) -> Result<Option<Volume>, StoreError> {
        Ok(self
            .volumes
            .read()
            .map_err(|e| StoreError::LockFailed(format!("volumes: {e}")))?
            .get(id)
            .cloned())
    }

    pub fn modify_images<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut ImageMap) -> Result<R, E>,
        E: From<StoreError>,
    {
        let live = self
            .images
            .write()
            .map_err(|e| StoreError::LockFailed(format!("images: {e}")))?;
        self.commit(live, f, |ledger, draft| ledger.images = draft)
    }

    pub fn modify_instances<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut InstanceMap) -> Result<R, E>,
        E: From<StoreError>,
    {
        let live = self
            .instances
            .write()
            .map_err(|e| StoreError::LockFailed(format!("instances: {e}")))?;
        self.commit(live, f, |ledger, draft| ledger.instances = draft)
    }

    pub fn modify_volumes<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut VolumeMap) -> Result<R, E>,
        E: From<StoreError>,
    {
        let live = self
            .volumes
            .write()
            .map_err(|e| StoreError::LockFailed(format!("volumes: {e}")))?;
        self.commit(live, f, |ledger, draft| ledger.volumes = draft)
    }

    pub fn remove_image(&self, id: &str) -> Result<(), StoreError> {
        self.modify_images(|images| {
            images.remove(id);
            Ok::<_, StoreError>(())
        })
    }

    /// Remove an instance, then clear the attachment of every volume that
    /// referenced it. The two steps are independent locked mutations.
    pub fn remove_instance(&self, id: &str) -> Result<(), StoreError> {
        self.modify_instances(|instances| {
            instances.remove(id);
            Ok::<_, StoreError>(())
        })?;
        self.modify_volumes(|volumes| {
            for volume in volumes.values_mut() {
                if volume.is_attached_to(id) {
                    volume.detach();
                }
            }
            Ok::<_, StoreError>(())
        })
    }

    pub fn remove_volume(&self, id: &str) -> Result<(), StoreError> {
        self.modify_volumes(|volumes| {
            volumes.remove(id);
            Ok::<_, StoreError>(())
        })
    }

    fn commit<M, R, E, F, U>(
        &self,
        mut live: RwLockWriteGuard<'_, M>,
        f: F,
        update: U,
    ) -> Result<R, E>
    where
        M: Clone,
        F: FnOnce(&mut M) -> Result<R, E>,
        E: From<StoreError>,
        U: FnOnce(&mut Ledger, M),
    {
        let mut draft = (*live).clone();
        let out = f(&mut draft)?;

        let mut persisted = self
            .persisted
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("state file: {e}")))?;
        let mut next = persisted.clone();
        update(&mut next, draft.clone());
        self.write(&next)?;
        *persisted = next;
        *live = draft;
        Ok(out)
    }

    fn write(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let lock_path = self.path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;

        let result = self.write_locked(&dir, ledger);
        if let Err(e) = lock.unlock() {
            warn!("failed to release {}: {e}", lock_path.display());
        }
        result
    }

    fn write_locked(&self, dir: &Path, ledger: &Ledger) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(ledger)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(dir)?;
        Ok(())
    }
}
