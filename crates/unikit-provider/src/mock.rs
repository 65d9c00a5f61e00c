//! Cloud-style backend against an in-memory authority.
//!
//! `MockAuthority` stands in for a remote compute API: it hands out
//! `ami-`/`i-`/`vol-` ids, boots instances asynchronously (pending, then
//! running after a few describe calls), addresses volumes by `/dev/sdX`
//! device names, and can be told to fail the next call of an operation.
//! `MockProvider` drives it exactly like a cloud backend would: side effect
//! first, bounded waits on asynchronous transitions, ledger last, and every
//! `List*` reconciles the ledger against the authority.

use crate::lookup::find_by_name_or_id;
use crate::mounts::{claim_mount_point, device_name_for_mount, verify_mounts_input};
use crate::provider::{sorted, Provider, ProviderConfig};
use crate::wait::Backoff;
use crate::{ProviderError, ResultExt};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use unikit_schema::{
    CreateVolumeParams, DeviceMapping, Image, ImageId, Infrastructure, Instance, InstanceId,
    InstanceState, MockConfig, RunInstanceParams, StageImageParams, Volume, VolumeId,
    ROOT_MOUNT_POINT,
};
use unikit_store::{BackendLayout, StateStore, StoreError};

const ROOT_DEVICE: &str = "/dev/sda1";
const DEFAULT_BOOT_POLLS: u32 = 2;

#[derive(Debug, Clone)]
struct RemoteInstance {
    name: String,
    image_id: String,
    state: InstanceState,
    /// Describe calls left before a pending instance is running.
    polls_left: u32,
    ip: String,
    console: String,
}

#[derive(Debug, Clone)]
struct RemoteVolume {
    size_mb: u64,
    attached: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct Authority {
    seq: u64,
    boot_polls: u32,
    images: HashMap<String, String>,
    instances: HashMap<String, RemoteInstance>,
    volumes: HashMap<String, RemoteVolume>,
    failures: HashSet<String>,
}

impl Authority {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{:08x}", self.seq)
    }

    /// Consume a failure injected for `op`.
    fn check(&mut self, op: &str) -> Result<(), ProviderError> {
        if self.failures.remove(op) {
            return Err(ProviderError::backend(op, "injected failure"));
        }
        Ok(())
    }

    fn advance(&mut self, id: &str) -> Option<&RemoteInstance> {
        let instance = self.instances.get_mut(id)?;
        if instance.state == InstanceState::Pending {
            if instance.polls_left == 0 {
                instance.state = InstanceState::Running;
                instance.console.push_str("network up\n");
            } else {
                instance.polls_left -= 1;
            }
        }
        Some(instance)
    }
}

/// Simulated remote compute authority shared by one or more providers.
pub struct MockAuthority {
    inner: Mutex<Authority>,
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::with_boot_polls(DEFAULT_BOOT_POLLS)
    }
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// An authority whose instances stay pending for `polls` describe calls.
    pub fn with_boot_polls(polls: u32) -> Self {
        Self {
            inner: Mutex::new(Authority {
                boot_polls: polls,
                ..Authority::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Authority>, ProviderError> {
        self.inner
            .lock()
            .map_err(|e| ProviderError::backend("authority", format!("lock poisoned: {e}")))
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.insert(op.to_owned());
        }
    }

    pub fn register_image(&self, name: &str) -> Result<String, ProviderError> {
        let mut inner = self.lock()?;
        inner.check("register image")?;
        let id = inner.next_id("ami");
        inner.images.insert(id.clone(), name.to_owned());
        Ok(id)
    }

    pub fn deregister_image(&self, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        inner.check("deregister image")?;
        inner.images.remove(id);
        Ok(())
    }

    pub fn image_ids(&self) -> Result<HashSet<String>, ProviderError> {
        Ok(self.lock()?.images.keys().cloned().collect())
    }

    /// Boot an instance with `devices` (device name, volume id) attached.
    pub fn run_instance(
        &self,
        name: &str,
        image_id: &str,
        devices: &[(String, String)],
    ) -> Result<String, ProviderError> {
        let mut inner = self.lock()?;
        inner.check("run instance")?;
        if !inner.images.contains_key(image_id) {
            return Err(ProviderError::backend(
                "run instance",
                format!("image {image_id} does not exist"),
            ));
        }
        for (device, volume_id) in devices {
            match inner.volumes.get(volume_id) {
                None => {
                    return Err(ProviderError::backend(
                        "run instance",
                        format!("volume {volume_id} does not exist"),
                    ))
                }
                Some(v) if v.attached.is_some() => {
                    return Err(ProviderError::backend(
                        "run instance",
                        format!("volume {volume_id} is in use ({device})"),
                    ))
                }
                Some(_) => {}
            }
        }
        let id = inner.next_id("i");
        let ip = format!("10.0.{}.{}", (inner.seq >> 8) & 0xff, inner.seq & 0xff);
        for (device, volume_id) in devices {
            if let Some(volume) = inner.volumes.get_mut(volume_id) {
                volume.attached = Some((id.clone(), device.clone()));
            }
        }
        let polls = inner.boot_polls;
        inner.instances.insert(
            id.clone(),
            RemoteInstance {
                name: name.to_owned(),
                image_id: image_id.to_owned(),
                state: InstanceState::Pending,
                polls_left: polls,
                ip,
                console: format!("booting {name} from {image_id}\n"),
            },
        );
        Ok(id)
    }

    /// Current state and address of an instance. Advances pending boots.
    pub fn describe_instance(
        &self,
        id: &str,
    ) -> Result<Option<(InstanceState, String)>, ProviderError> {
        let mut inner = self.lock()?;
        inner.check("describe instance")?;
        Ok(inner.advance(id).map(|i| (i.state, i.ip.clone())))
    }

    pub fn console_output(&self, id: &str) -> Result<String, ProviderError> {
        let inner = self.lock()?;
        inner
            .instances
            .get(id)
            .map(|i| i.console.clone())
            .ok_or_else(|| ProviderError::backend("console output", format!("no instance {id}")))
    }

    pub fn start_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.transition(id, "start instance", |i| match i.state {
            InstanceState::Stopped => {
                i.state = InstanceState::Pending;
                i.console.push_str("starting\n");
                Ok(())
            }
            InstanceState::Running | InstanceState::Pending => Ok(()),
            other => Err(format!("cannot start an instance that is {other}")),
        })
    }

    pub fn stop_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.transition(id, "stop instance", |i| match i.state {
            InstanceState::Running | InstanceState::Pending | InstanceState::Stopped => {
                i.state = InstanceState::Stopped;
                i.console.push_str("stopping\n");
                Ok(())
            }
            other => Err(format!("cannot stop an instance that is {other}")),
        })
    }

    /// Terminate an instance and release the volumes attached to it.
    pub fn terminate_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.transition(id, "terminate instance", |i| {
            i.state = InstanceState::Terminated;
            Ok(())
        })?;
        let mut inner = self.lock()?;
        for volume in inner.volumes.values_mut() {
            if volume.attached.as_ref().is_some_and(|(owner, _)| owner == id) {
                volume.attached = None;
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        op: &str,
        f: impl FnOnce(&mut RemoteInstance) -> Result<(), String>,
    ) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        inner.check(op)?;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| ProviderError::backend(op, format!("no instance {id}")))?;
        f(instance).map_err(|e| ProviderError::backend(op, e))
    }

    pub fn create_volume(&self, size_mb: u64) -> Result<String, ProviderError> {
        let mut inner = self.lock()?;
        inner.check("create volume")?;
        let id = inner.next_id("vol");
        inner.volumes.insert(
            id.clone(),
            RemoteVolume {
                size_mb,
                attached: None,
            },
        );
        Ok(id)
    }

    pub fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        inner.check("delete volume")?;
        match inner.volumes.get(id) {
            Some(v) if v.attached.is_some() => Err(ProviderError::backend(
                "delete volume",
                format!("volume {id} is in use"),
            )),
            _ => {
                inner.volumes.remove(id);
                Ok(())
            }
        }
    }

    pub fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        inner.check("attach volume")?;
        let usable = inner
            .instances
            .get(instance_id)
            .is_some_and(|i| !matches!(i.state, InstanceState::Terminated));
        if !usable {
            return Err(ProviderError::backend(
                "attach volume",
                format!("instance {instance_id} is not available"),
            ));
        }
        let taken = inner.volumes.values().any(|v| {
            v.attached
                .as_ref()
                .is_some_and(|(owner, dev)| owner == instance_id && dev == device)
        });
        if taken {
            return Err(ProviderError::backend(
                "attach volume",
                format!("device {device} is already in use on {instance_id}"),
            ));
        }
        let volume = inner
            .volumes
            .get_mut(id)
            .ok_or_else(|| ProviderError::backend("attach volume", format!("no volume {id}")))?;
        if volume.attached.is_some() {
            return Err(ProviderError::backend(
                "attach volume",
                format!("volume {id} is in use"),
            ));
        }
        volume.attached = Some((instance_id.to_owned(), device.to_owned()));
        Ok(())
    }

    pub fn detach_volume(&self, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        inner.check("detach volume")?;
        let volume = inner
            .volumes
            .get_mut(id)
            .ok_or_else(|| ProviderError::backend("detach volume", format!("no volume {id}")))?;
        volume.attached = None;
        Ok(())
    }

    /// Volume ids mapped to the instance each is attached to.
    pub fn volume_attachments(&self) -> Result<HashMap<String, Option<String>>, ProviderError> {
        Ok(self
            .lock()?
            .volumes
            .iter()
            .map(|(id, v)| (id.clone(), v.attached.as_ref().map(|(i, _)| i.clone())))
            .collect())
    }

    /// Device name a volume is attached under, if attached.
    pub fn volume_device(&self, id: &str) -> Result<Option<String>, ProviderError> {
        Ok(self
            .lock()?
            .volumes
            .get(id)
            .and_then(|v| v.attached.as_ref().map(|(_, dev)| dev.clone())))
    }

    pub fn volume_size(&self, id: &str) -> Result<Option<u64>, ProviderError> {
        Ok(self.lock()?.volumes.get(id).map(|v| v.size_mb))
    }

    /// Drop an instance and its attachments as if it were removed behind
    /// our back.
    pub fn forget_instance(&self, id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.instances.remove(id);
            for volume in inner.volumes.values_mut() {
                if volume.attached.as_ref().is_some_and(|(owner, _)| owner == id) {
                    volume.attached = None;
                }
            }
        }
    }

    pub fn set_instance_state(&self, id: &str, state: InstanceState) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(instance) = inner.instances.get_mut(id) {
                instance.state = state;
            }
        }
    }

    /// Ids of instances the authority knows about, including ones this
    /// ledger never recorded.
    pub fn instance_ids(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.lock()?.instances.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn instance_image(&self, id: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.lock()?.instances.get(id).map(|i| i.image_id.clone()))
    }

    pub fn instance_name(&self, id: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.lock()?.instances.get(id).map(|i| i.name.clone()))
    }
}

pub struct MockProvider {
    name: String,
    region: String,
    state: StateStore,
    authority: Arc<MockAuthority>,
    backoff: Backoff,
}

impl MockProvider {
    pub fn new(
        config: &MockConfig,
        home: &Path,
        authority: Arc<MockAuthority>,
    ) -> Result<Self, ProviderError> {
        let layout = BackendLayout::new(home, &config.name);
        fs::create_dir_all(layout.root())?;
        let state = StateStore::open(layout.state_file())?;
        info!(backend = %config.name, region = %config.region, "mock provider ready");
        Ok(Self {
            name: config.name.clone(),
            region: config.region.clone(),
            state,
            authority,
            backoff: Backoff::default().initial(Duration::from_millis(50)),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn authority(&self) -> &Arc<MockAuthority> {
        &self.authority
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn find_instance(&self, query: &str) -> Result<Instance, ProviderError> {
        find_by_name_or_id(self.state.instances()?.into_values().collect(), query)
    }

    fn find_volume(&self, query: &str) -> Result<Volume, ProviderError> {
        find_by_name_or_id(self.state.volumes()?.into_values().collect(), query)
    }

    /// Poll the authority until the instance reaches `target`.
    fn wait_for_state(
        &self,
        id: &str,
        target: InstanceState,
    ) -> Result<(InstanceState, String), ProviderError> {
        self.backoff
            .wait(&format!("instance {id} {target}"), || {
                match self.authority.describe_instance(id)? {
                    Some((state, ip)) if state == target => Ok(Some((state, ip))),
                    Some((InstanceState::Error | InstanceState::Terminated, _))
                        if target != InstanceState::Terminated =>
                    {
                        Err(ProviderError::backend(
                            "waiting for instance",
                            format!("instance {id} failed to reach {target}"),
                        ))
                    }
                    Some(_) => Ok(None),
                    None => Err(ProviderError::backend(
                        "waiting for instance",
                        format!("instance {id} disappeared"),
                    )),
                }
            })
    }

    fn set_instance_state(
        &self,
        id: &InstanceId,
        state: InstanceState,
        ip: Option<String>,
    ) -> Result<(), ProviderError> {
        self.state.modify_instances(|instances| {
            let record = instances
                .get_mut(id.as_str())
                .ok_or_else(|| ProviderError::StateInconsistent {
                    kind: "instance",
                    id: id.to_string(),
                })?;
            record.state = state;
            if let Some(ip) = ip {
                record.ip_address = ip;
            }
            Ok(())
        })
    }

    fn clear_attachment(&self, volume_id: &VolumeId) -> Result<(), ProviderError> {
        self.state.modify_volumes(|volumes| {
            let record = volumes.get_mut(volume_id.as_str()).ok_or_else(|| {
                ProviderError::StateInconsistent {
                    kind: "volume",
                    id: volume_id.to_string(),
                }
            })?;
            record.detach();
            Ok(())
        })
    }

    /// Record a booted instance and its volumes. The name is checked again
    /// under the ledger lock; on failure nothing stays recorded.
    fn record_instance(
        &self,
        instance: &Instance,
        volumes: &BTreeMap<String, Volume>,
    ) -> Result<(), ProviderError> {
        self.state.modify_instances(|instances| {
            if instances.values().any(|i| i.name == instance.name) {
                return Err(ProviderError::NameConflict {
                    kind: "instance",
                    name: instance.name.clone(),
                });
            }
            instances.insert(instance.id.clone(), instance.clone());
            Ok(())
        })?;
        let claimed = self.state.modify_volumes(|all| {
            for (mount_point, volume) in volumes {
                claim_mount_point(all, &volume.id, &instance.id, mount_point)?;
            }
            Ok(())
        });
        if claimed.is_err() {
            self.state.remove_instance(&instance.id)?;
        }
        claimed
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ProviderConfig {
        ProviderConfig {
            use_partition_tables: true,
        }
    }

    fn stage(&self, params: &StageImageParams) -> Result<Image, ProviderError> {
        if params.name.is_empty() {
            return Err(ProviderError::InvalidParams("image name is required".to_owned()));
        }
        let existing = self
            .state
            .images()?
            .into_values()
            .find(|i| i.name == params.name);
        if let Some(existing) = existing {
            if !params.force {
                return Err(ProviderError::NameConflict {
                    kind: "image",
                    name: params.name.clone(),
                });
            }
            warn!("force: deleting previous image with name {}", params.name);
            self.delete_image(&existing.id, true)
                .context("removing previously existing image")?;
        }

        let size_bytes = fs::metadata(&params.raw_image.local_image_path)
            .with_context(|| {
                format!(
                    "reading raw image {}",
                    params.raw_image.local_image_path.display()
                )
            })?
            .len();
        let id = self
            .authority
            .register_image(&params.name)
            .context("registering image")?;

        let mut run_spec = params.raw_image.run_spec.clone();
        if run_spec.mapping_for(ROOT_MOUNT_POINT).is_none() {
            run_spec
                .device_mappings
                .insert(0, DeviceMapping::new(ROOT_MOUNT_POINT, ROOT_DEVICE));
        }
        let image = Image {
            id: ImageId::new(id.as_str()),
            name: params.name.clone(),
            size_mb: size_bytes.div_ceil(1 << 20),
            infrastructure: Infrastructure::Mock,
            created: Utc::now(),
            stage_spec: params.raw_image.stage_spec.clone(),
            run_spec,
        };
        let recorded = self
            .state
            .modify_images(|images| {
                images.insert(image.id.clone(), image.clone());
                Ok::<_, StoreError>(())
            })
            .context("modifying image map in state");
        if let Err(e) = recorded {
            if !params.no_cleanup {
                let _ = self.authority.deregister_image(&id);
            }
            return Err(e);
        }
        info!(image = %image.id, name = %image.name, "image registered");
        Ok(image)
    }

    /// Images the authority no longer knows are dropped from the ledger.
    fn list_images(&self) -> Result<Vec<Image>, ProviderError> {
        let known = self.authority.image_ids()?;
        let stale: Vec<ImageId> = self
            .state
            .images()?
            .into_keys()
            .filter(|id| !known.contains(id.as_str()))
            .collect();
        if !stale.is_empty() {
            self.state.modify_images(|images| {
                for id in &stale {
                    debug!("image {id} is gone from the authority");
                    images.remove(id);
                }
                Ok::<_, StoreError>(())
            })?;
        }
        Ok(sorted(self.state.images()?.into_values().collect(), |i| {
            i.name.clone()
        }))
    }

    fn delete_image(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        let image = find_by_name_or_id(self.state.images()?.into_values().collect(), id)?;
        let dependents: Vec<Instance> = self
            .list_instances()?
            .into_iter()
            .filter(|i| i.image_id == image.id)
            .collect();
        if !dependents.is_empty() {
            if !force {
                return Err(ProviderError::ImageInUse {
                    image: image.id.to_string(),
                    count: dependents.len(),
                });
            }
            for instance in &dependents {
                self.delete_instance(&instance.id, true)
                    .with_context(|| format!("deleting instance {}", instance.id))?;
            }
        }
        self.authority
            .deregister_image(&image.id)
            .context("deregistering image")?;
        self.state.remove_image(&image.id)?;
        info!(image = %image.id, "image deleted");
        Ok(())
    }

    fn run_instance(&self, params: &RunInstanceParams) -> Result<Instance, ProviderError> {
        info!(
            image = %params.image_id,
            mounts = ?params.mount_points_to_volume_ids,
            "running instance {}",
            params.name
        );
        if params.name.is_empty() {
            return Err(ProviderError::InvalidParams("instance name is required".to_owned()));
        }
        if self
            .state
            .instances()?
            .values()
            .any(|i| i.name == params.name)
        {
            return Err(ProviderError::NameConflict {
                kind: "instance",
                name: params.name.clone(),
            });
        }
        let image = self.get_image(&params.image_id).context("getting image")?;
        let known_volumes = self.list_volumes()?;
        let resolved = verify_mounts_input(&image, &params.mount_points_to_volume_ids, |v| {
            find_by_name_or_id(known_volumes.clone(), v)
        })
        .context("invalid mapping for volume")?;

        let mut devices = Vec::with_capacity(resolved.len());
        for (mount_point, volume) in &resolved {
            if let Some(owner) = &volume.attachment {
                return Err(ProviderError::AlreadyAttached {
                    volume: volume.id.to_string(),
                    instance: owner.to_string(),
                });
            }
            devices.push((
                device_name_for_mount(&image, mount_point)?,
                volume.id.to_string(),
            ));
        }
        if !params.env.is_empty() {
            debug!("env is baked into the image on this backend; ignoring {:?}", params.env);
        }

        let id = self
            .authority
            .run_instance(&params.name, &image.id, &devices)
            .context("running instance")?;
        let booted = self.wait_for_state(&id, InstanceState::Running);
        let (state, ip) = match booted {
            Ok(running) => running,
            Err(e) => {
                if params.no_cleanup {
                    warn!("no-cleanup set: leaving instance {id} behind");
                } else if let Err(cleanup) = self.authority.terminate_instance(&id) {
                    warn!("cleanup: failed to terminate instance {id}: {cleanup}");
                }
                return Err(e);
            }
        };

        let instance = Instance {
            id: InstanceId::new(id.as_str()),
            name: params.name.clone(),
            state,
            ip_address: ip,
            image_id: image.id.clone(),
            infrastructure: Infrastructure::Mock,
            created: Utc::now(),
        };
        if let Err(e) = self.record_instance(&instance, &resolved) {
            if params.no_cleanup {
                warn!("no-cleanup set: leaving instance {id} behind");
            } else if let Err(cleanup) = self.authority.terminate_instance(&id) {
                warn!("cleanup: failed to terminate instance {id}: {cleanup}");
            }
            return Err(e);
        }
        info!(instance = %instance.id, ip = %instance.ip_address, "instance running");
        Ok(instance)
    }

    /// Ledger instances are refreshed from the authority. Terminated or
    /// vanished ones are removed; instances only the authority knows are
    /// left alone.
    fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let recorded = self.state.instances()?;
        let mut gone = Vec::new();
        let mut updates = BTreeMap::new();
        for instance in recorded.values() {
            match self.authority.describe_instance(&instance.id)? {
                None | Some((InstanceState::Terminated, _)) => gone.push(instance.id.clone()),
                Some((state, ip)) if state != instance.state || ip != instance.ip_address => {
                    updates.insert(instance.id.clone(), (state, ip));
                }
                Some(_) => {}
            }
        }
        for id in &gone {
            info!("instance {id} is no longer known to the authority");
            self.state.remove_instance(id)?;
        }
        if !updates.is_empty() {
            self.state.modify_instances(|instances| {
                for (id, (state, ip)) in &updates {
                    if let Some(record) = instances.get_mut(id.as_str()) {
                        record.state = *state;
                        record.ip_address.clone_from(ip);
                    }
                }
                Ok::<_, StoreError>(())
            })?;
        }
        Ok(sorted(self.state.instances()?.into_values().collect(), |i| {
            i.name.clone()
        }))
    }

    fn delete_instance(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        let instance = self.find_instance(id)?;
        if instance.state == InstanceState::Running && !force {
            return Err(ProviderError::InstanceRunning(instance.id.to_string()));
        }
        self.authority
            .terminate_instance(&instance.id)
            .context("terminating instance")?;
        self.wait_for_state(&instance.id, InstanceState::Terminated)?;
        self.state.remove_instance(&instance.id)?;
        info!(instance = %instance.id, "instance deleted");
        Ok(())
    }

    fn start_instance(&self, id: &str) -> Result<(), ProviderError> {
        let instance = self.find_instance(id)?;
        self.authority
            .start_instance(&instance.id)
            .context("starting instance")?;
        let (state, ip) = self.wait_for_state(&instance.id, InstanceState::Running)?;
        self.set_instance_state(&instance.id, state, Some(ip))
    }

    fn stop_instance(&self, id: &str) -> Result<(), ProviderError> {
        let instance = self.find_instance(id)?;
        self.authority
            .stop_instance(&instance.id)
            .context("stopping instance")?;
        let (state, _) = self.wait_for_state(&instance.id, InstanceState::Stopped)?;
        self.set_instance_state(&instance.id, state, None)
    }

    fn get_instance_logs(&self, id: &str) -> Result<String, ProviderError> {
        let instance = self.get_instance(id)?;
        self.authority.console_output(&instance.id)
    }

    fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, ProviderError> {
        if params.name.is_empty() {
            return Err(ProviderError::InvalidParams("volume name is required".to_owned()));
        }
        let size_mb = match (&params.image_path, params.size_mb) {
            (Some(path), _) => fs::metadata(path)
                .with_context(|| format!("reading {}", path.display()))?
                .len()
                .div_ceil(1 << 20),
            (None, Some(size)) if size > 0 => size,
            _ => {
                return Err(ProviderError::InvalidParams(
                    "a volume needs either an image path or a size".to_owned(),
                ))
            }
        };
        if self
            .state
            .volumes()?
            .values()
            .any(|v| v.name == params.name)
        {
            return Err(ProviderError::NameConflict {
                kind: "volume",
                name: params.name.clone(),
            });
        }

        let id = self
            .authority
            .create_volume(size_mb)
            .context("creating volume")?;
        let volume = Volume {
            id: VolumeId::new(id.as_str()),
            name: params.name.clone(),
            size_mb,
            attachment: None,
            mount_point: None,
            infrastructure: Infrastructure::Mock,
            created: Utc::now(),
        };
        let recorded = self
            .state
            .modify_volumes(|volumes| {
                volumes.insert(volume.id.clone(), volume.clone());
                Ok::<_, StoreError>(())
            })
            .context("modifying volume map in state");
        if let Err(e) = recorded {
            if !params.no_cleanup {
                let _ = self.authority.delete_volume(&id);
            }
            return Err(e);
        }
        info!(volume = %volume.id, size_mb, "volume created");
        Ok(volume)
    }

    /// Volumes the authority no longer knows are removed and attachments
    /// follow what the authority reports.
    fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError> {
        let remote = self.authority.volume_attachments()?;
        let changed = self.state.volumes()?.values().any(|v| match remote.get(v.id.as_str()) {
            None => true,
            Some(attached) => attached.as_deref() != v.attachment.as_deref(),
        });
        if changed {
            self.state.modify_volumes(|volumes| {
                volumes.retain(|id, _| remote.contains_key(id.as_str()));
                for (id, volume) in volumes.iter_mut() {
                    match remote.get(id.as_str()).map(Option::as_deref) {
                        None | Some(None) => volume.detach(),
                        Some(Some(owner)) if volume.is_attached_to(owner) => {}
                        Some(Some(owner)) => {
                            volume.attachment = Some(InstanceId::from(owner));
                            volume.mount_point = None;
                        }
                    }
                }
                Ok::<_, StoreError>(())
            })?;
        }
        Ok(sorted(self.state.volumes()?.into_values().collect(), |v| {
            v.name.clone()
        }))
    }

    fn delete_volume(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        let volume = self.find_volume(id)?;
        if let Some(instance) = &volume.attachment {
            if !force {
                return Err(ProviderError::VolumeInUse {
                    volume: volume.id.to_string(),
                    instance: instance.to_string(),
                });
            }
            self.detach_volume(&volume.id)
                .with_context(|| format!("detaching volume {}", volume.id))?;
        }
        self.authority
            .delete_volume(&volume.id)
            .context("deleting volume")?;
        self.state.remove_volume(&volume.id)?;
        info!(volume = %volume.id, "volume deleted");
        Ok(())
    }

    fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
        mount_point: &str,
    ) -> Result<(), ProviderError> {
        let volume = self.find_volume(id)?;
        if let Some(owner) = &volume.attachment {
            return Err(ProviderError::AlreadyAttached {
                volume: volume.id.to_string(),
                instance: owner.to_string(),
            });
        }
        let instance = self.find_instance(instance_id)?;
        let image = self.state.image(&instance.image_id)?.ok_or_else(|| {
            ProviderError::StateInconsistent {
                kind: "image",
                id: instance.image_id.to_string(),
            }
        })?;
        let device = device_name_for_mount(&image, mount_point)?;
        self.state.modify_volumes(|volumes| {
            claim_mount_point(volumes, &volume.id, &instance.id, mount_point)
        })?;
        let attached = self
            .authority
            .attach_volume(&volume.id, &instance.id, &device)
            .with_context(|| format!("attaching volume {} at {device}", volume.id));
        if attached.is_err() {
            self.clear_attachment(&volume.id)?;
        }
        attached
    }

    fn detach_volume(&self, id: &str) -> Result<(), ProviderError> {
        let volume = self.find_volume(id)?;
        if volume.attachment.is_none() {
            return Err(ProviderError::NotAttached(volume.id.to_string()));
        }
        self.authority
            .detach_volume(&volume.id)
            .context("detaching volume")?;
        self.clear_attachment(&volume.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_boots_after_polls() {
        let authority = MockAuthority::with_boot_polls(2);
        let ami = authority.register_image("app").unwrap();
        let id = authority.run_instance("web", &ami, &[]).unwrap();
        assert!(id.starts_with("i-"));

        let states: Vec<InstanceState> = (0..4)
            .map(|_| authority.describe_instance(&id).unwrap().unwrap().0)
            .collect();
        assert_eq!(
            states,
            vec![
                InstanceState::Pending,
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::Running
            ]
        );
    }

    #[test]
    fn injected_failure_fires_once() {
        let authority = MockAuthority::new();
        authority.fail_next("create volume");
        assert!(authority.create_volume(1).is_err());
        assert!(authority.create_volume(1).unwrap().starts_with("vol-"));
    }

    #[test]
    fn authority_refuses_double_attach() {
        let authority = MockAuthority::with_boot_polls(0);
        let ami = authority.register_image("app").unwrap();
        let i1 = authority.run_instance("a", &ami, &[]).unwrap();
        let i2 = authority.run_instance("b", &ami, &[]).unwrap();
        let vol = authority.create_volume(1).unwrap();

        authority.attach_volume(&vol, &i1, "/dev/sdb").unwrap();
        assert!(authority.attach_volume(&vol, &i2, "/dev/sdb").is_err());
        assert!(authority.delete_volume(&vol).is_err());

        authority.terminate_instance(&i1).unwrap();
        assert_eq!(authority.volume_attachments().unwrap()[&vol], None);
        authority.delete_volume(&vol).unwrap();
    }

    #[test]
    fn unknown_image_rejected() {
        let authority = MockAuthority::new();
        assert!(authority.run_instance("web", "ami-missing", &[]).is_err());
    }
}
