//! Process-based reference backend.
//!
//! Images are directories under the backend layout holding `boot.img` and,
//! for kernels booted directly, `program.bin` plus the stored boot
//! descriptor `cmdline`. Instances are VMM processes identified by pid;
//! volumes are raw disk files. Hot attach and detach go through the VMM's
//! QMP socket at `instances/<name>/qmp.sock`.

use crate::bootconfig::inject_env;
use crate::devices::RumpTarget;
use crate::hub::{pack_image_dir, unpack_image_dir, HubClient};
use crate::listener::{InstanceListener, FIRST_BOOT_TIMEOUT};
use crate::lookup::find_by_name_or_id;
use crate::mounts::{
    claim_mount_point, controller_port_for_mount, ordered_volumes, verify_mounts_input,
    BoundVolume,
};
use crate::provider::{sorted, Provider, ProviderConfig};
use crate::vmm::{disk_slot, LaunchSpec, ProcessDriver, VmmDriver};
use crate::wait::Backoff;
use crate::{ProviderError, ResultExt};
use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use unikit_schema::{
    CreateVolumeParams, Image, ImageFormat, ImageId, Infrastructure, Instance, InstanceId,
    InstanceState, PullImageParams, PushImageParams, QemuConfig, RemoteDeleteImageParams,
    RunInstanceParams, StageImageParams, Volume, VolumeId, ROOT_MOUNT_POINT,
};
use unikit_store::{BackendLayout, StateStore, StoreError};

const DEFAULT_MEMORY_MB: u32 = 512;
const NETDEV: &str = "user,id=mynet0,net=192.168.76.0/24,dhcpstart=192.168.76.9";
const BOOT_FILES: [&str; 3] = ["boot.img", "program.bin", "cmdline"];

pub struct QemuProvider {
    config: QemuConfig,
    layout: BackendLayout,
    state: StateStore,
    driver: Arc<dyn VmmDriver>,
    /// Image of the instance last started in debug mode.
    debug_target: Mutex<Option<String>>,
    exit_backoff: Backoff,
    /// Receives address announcements when IP discovery is on.
    listener: Option<Arc<InstanceListener>>,
    announce_timeout: Duration,
}

impl QemuProvider {
    pub fn new(config: QemuConfig, home: &Path) -> Result<Self, ProviderError> {
        Self::with_driver(config, home, Arc::new(ProcessDriver::new()))
    }

    pub fn with_driver(
        config: QemuConfig,
        home: &Path,
        driver: Arc<dyn VmmDriver>,
    ) -> Result<Self, ProviderError> {
        let layout = BackendLayout::new(home, &config.name);
        layout.initialize()?;
        let state = StateStore::open(layout.state_file())?;
        info!(
            backend = %config.name,
            root = %layout.root().display(),
            "qemu provider ready"
        );
        let listener = config
            .discover_ips
            .then(|| Arc::new(InstanceListener::new()));
        Ok(Self {
            config,
            layout,
            state,
            driver,
            debug_target: Mutex::new(None),
            exit_backoff: Backoff::default().max_interval(Duration::from_secs(1)),
            listener,
            announce_timeout: FIRST_BOOT_TIMEOUT,
        })
    }

    /// Learn instance addresses from `listener`, waiting up to `timeout`
    /// after each launch.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<InstanceListener>, timeout: Duration) -> Self {
        self.listener = Some(listener);
        self.announce_timeout = timeout;
        self
    }

    /// Backoff used while waiting for a killed VMM to exit.
    #[must_use]
    pub fn with_exit_backoff(mut self, backoff: Backoff) -> Self {
        self.exit_backoff = backoff;
        self
    }

    pub fn layout(&self) -> &BackendLayout {
        &self.layout
    }

    /// Name of the image the debugger should attach to, if any.
    pub fn debug_target(&self) -> Option<String> {
        self.debug_target.lock().ok().and_then(|t| t.clone())
    }

    fn set_debug_target(&self, target: Option<String>) {
        if let Ok(mut current) = self.debug_target.lock() {
            *current = target;
        }
    }

    fn monitor_path(&self, instance_name: &str) -> PathBuf {
        self.layout.instance_dir(instance_name).join("qmp.sock")
    }

    fn find_image(&self, query: &str) -> Result<Image, ProviderError> {
        find_by_name_or_id(self.state.images()?.into_values().collect(), query)
    }

    fn find_instance(&self, query: &str) -> Result<Instance, ProviderError> {
        find_by_name_or_id(self.state.instances()?.into_values().collect(), query)
    }

    fn find_volume(&self, query: &str) -> Result<Volume, ProviderError> {
        find_by_name_or_id(self.state.volumes()?.into_values().collect(), query)
    }

    fn is_alive(&self, instance: &Instance) -> bool {
        match instance.id.parse::<u32>() {
            Ok(pid) => self.driver.is_alive(pid),
            Err(_) => {
                warn!("instance {} has an invalid id (is not a pid)", instance.id);
                false
            }
        }
    }

    /// Copy the compiler output into the image directory and return the
    /// number of bytes copied.
    ///
    /// A folder bundle is copied as is. A single boot disk also brings along
    /// the kernel and boot descriptor the compiler writes next to it.
    fn copy_boot_files(
        &self,
        name: &str,
        source: &Path,
        format: ImageFormat,
    ) -> Result<u64, ProviderError> {
        let dir = self.layout.image_dir(name);
        fs::create_dir_all(&dir)?;
        let mut total = 0;
        if format == ImageFormat::Folder || source.is_dir() {
            for entry in fs::read_dir(source)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    total += fs::copy(entry.path(), dir.join(entry.file_name()))?;
                }
            }
            return Ok(total);
        }

        total += fs::copy(source, self.layout.boot_image_path(name))
            .with_context(|| format!("copying {}", source.display()))?;
        if let Some(parent) = source.parent() {
            for file in &BOOT_FILES[1..] {
                let sibling = parent.join(file);
                if sibling.is_file() {
                    total += fs::copy(&sibling, dir.join(file))?;
                }
            }
        }
        Ok(total)
    }

    /// VMM arguments for booting `image` with `volumes` in controller order.
    fn instance_args(
        &self,
        image: &Image,
        params: &RunInstanceParams,
        volumes: &[BoundVolume],
    ) -> Result<Vec<String>, ProviderError> {
        let memory = match (params.instance_memory, image.run_spec.default_instance_memory) {
            (0, 0) => DEFAULT_MEMORY_MB,
            (0, default) => default,
            (requested, _) => requested,
        };
        let mut args = vec!["-m".to_owned(), memory.to_string()];
        args.extend(network_args(&params.name));

        let boot_image = self.layout.boot_image_path(&image.name);
        match fs::read_to_string(self.layout.cmdline_path(&image.name)) {
            Ok(cmdline) => {
                let cmdline = if image.run_spec.is_rump() {
                    inject_env(&cmdline, &params.env)?
                } else {
                    if !params.env.is_empty() {
                        warn!("image {} does not accept run-time env; ignoring it", image.name);
                    }
                    cmdline
                };
                if boot_image.exists() {
                    args.push("-device".to_owned());
                    args.push(format!("virtio-blk-pci,id=blk0,drive=hd0,addr={}", disk_slot(0)));
                    args.push("-drive".to_owned());
                    args.push(format!(
                        "file={},format={},if=none,id=hd0",
                        boot_image.display(),
                        drive_format(image.stage_spec.image_format)
                    ));
                }
                args.push("-kernel".to_owned());
                args.push(self.layout.kernel_path(&image.name).display().to_string());
                args.push("-append".to_owned());
                args.push(cmdline.trim_end().replace(',', ",,"));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("cmdline not found, assuming classic bootloader");
                args.push("-drive".to_owned());
                args.push(format!("file={},format=raw,if=ide", boot_image.display()));
            }
            Err(e) => return Err(e).context("reading boot descriptor"),
        }

        if params.debug_mode {
            args.push("-s".to_owned());
            args.push("-S".to_owned());
        }
        if self.config.no_graphic {
            args.extend(["-nographic", "-vga", "none"].map(str::to_owned));
        }
        for bound in volumes {
            debug!(
                "volume {} at {} on controller port {}",
                bound.volume.id, bound.mount_point, bound.port
            );
            let drive = drive_id(&bound.volume);
            args.push("-drive".to_owned());
            args.push(format!(
                "file={},format=raw,if=none,id={drive}",
                self.layout.volume_image_path(&bound.volume.name).display()
            ));
            args.push("-device".to_owned());
            args.push(format!(
                "virtio-blk-pci,drive={drive},id=dev-{drive},addr={}",
                disk_slot(bound.port)
            ));
        }
        args.push("-qmp".to_owned());
        args.push(format!(
            "unix:{},server,nowait",
            self.monitor_path(&params.name).display()
        ));
        Ok(args)
    }

    /// Record a launched instance and mark its boot volumes attached.
    fn record_instance(
        &self,
        instance: &Instance,
        volumes: &[BoundVolume],
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
        if volumes.is_empty() {
            return Ok(());
        }
        let claimed = self.state.modify_volumes(|all| {
            for bound in volumes {
                claim_mount_point(all, &bound.volume.id, &instance.id, &bound.mount_point)?;
            }
            Ok(())
        });
        if claimed.is_err() {
            self.state.remove_instance(&instance.id)?;
        }
        claimed
    }

    /// Wait for `instance` to announce its address and record it. A missing
    /// announcement leaves the address empty.
    fn discover_ip(&self, listener: &InstanceListener, mut instance: Instance) -> Instance {
        let prefix = announce_prefix(&instance.name);
        let ip = match listener.wait_for_ip(&prefix, self.announce_timeout) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("instance {} did not announce an address: {e}", instance.name);
                return instance;
            }
        };
        let recorded = self.state.modify_instances(|instances| {
            if let Some(record) = instances.get_mut(instance.id.as_str()) {
                record.ip_address.clone_from(&ip);
            }
            Ok::<_, StoreError>(())
        });
        match recorded {
            Ok(()) => instance.ip_address = ip,
            Err(e) => warn!("failed recording address of instance {}: {e}", instance.name),
        }
        instance
    }

    /// Kill the VMM behind `instance` and wait for it to go away.
    fn terminate(&self, instance: &Instance) -> Result<(), ProviderError> {
        let Ok(pid) = instance.id.parse::<u32>() else {
            warn!("instance {} has an invalid id (is not a pid)", instance.id);
            return Ok(());
        };
        if let Err(e) = self.driver.kill(pid) {
            warn!("failed terminating instance {}, assuming it exited: {e}", instance.name);
        }
        self.exit_backoff
            .wait(&format!("instance {} to exit", instance.name), || {
                Ok((!self.driver.is_alive(pid)).then_some(()))
            })
    }

    /// Remove the directory of a failed launch unless a recorded instance
    /// with the same name owns it.
    fn release_instance_dir(&self, name: &str) {
        let owned = match self.state.instances() {
            Ok(instances) => instances.values().any(|i| i.name == name),
            Err(_) => true,
        };
        if !owned {
            let _ = fs::remove_dir_all(self.layout.instance_dir(name));
        }
    }

    /// Drop an instance's directory and ledger record.
    fn forget_instance(&self, instance: &Instance) -> Result<(), ProviderError> {
        remove_dir_if_exists(&self.layout.instance_dir(&instance.name))?;
        self.state.remove_instance(&instance.id)?;
        Ok(())
    }

    fn release_claim(&self, volume_id: &VolumeId) -> Result<(), ProviderError> {
        self.state.modify_volumes(|volumes| {
            if let Some(record) = volumes.get_mut(volume_id.as_str()) {
                record.detach();
            }
            Ok::<_, StoreError>(())
        })?;
        Ok(())
    }

    fn image_by_name(&self, name: &str) -> Result<Option<Image>, ProviderError> {
        Ok(self.state.images()?.into_values().find(|i| i.name == name))
    }

    /// Delete an existing image named `name` if `force`, else refuse.
    fn replace_existing_image(&self, name: &str, force: bool) -> Result<(), ProviderError> {
        if let Some(existing) = self.image_by_name(name)? {
            if !force {
                return Err(ProviderError::NameConflict {
                    kind: "image",
                    name: name.to_owned(),
                });
            }
            warn!("force: deleting previous image with name {name}");
            self.delete_image(&existing.id, true)
                .context("removing previously existing image")?;
        }
        Ok(())
    }
}

/// QEMU `format=` value for a stored boot image.
fn drive_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Raw | ImageFormat::Folder => "raw",
        ImageFormat::Qcow2 => "qcow2",
        ImageFormat::Vhd => "vpc",
        ImageFormat::Vmdk => "vmdk",
    }
}

fn drive_id(volume: &Volume) -> String {
    format!("vol-{}", volume.id)
}

/// Locally administered MAC for an instance, stable across restarts.
fn instance_mac(name: &str) -> [u8; 6] {
    let hash = blake3::hash(name.as_bytes());
    let tail = hash.as_bytes();
    [0x52, 0x54, 0x00, tail[0], tail[1], tail[2]]
}

/// Prefix the instance puts before its address when it announces itself:
/// the MAC as bare hex.
fn announce_prefix(name: &str) -> String {
    instance_mac(name).iter().map(|b| format!("{b:02x}")).collect()
}

fn network_args(name: &str) -> Vec<String> {
    let mac = instance_mac(name)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":");
    vec![
        "-net".to_owned(),
        format!("nic,model=virtio,netdev=mynet0,macaddr={mac}"),
        "-netdev".to_owned(),
        NETDEV.to_owned(),
    ]
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), ProviderError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
    }
}

/// Run `cleanup` when `result` failed, unless the caller asked to keep
/// partial resources around for debugging.
fn cleanup_on_error<T>(
    result: Result<T, ProviderError>,
    no_cleanup: bool,
    cleanup: impl FnOnce(),
) -> Result<T, ProviderError> {
    if result.is_err() {
        if no_cleanup {
            warn!("no-cleanup set: leaving partial resources in place");
        } else {
            cleanup();
        }
    }
    result
}

fn require_name(kind: &str, name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.contains('/') {
        return Err(ProviderError::InvalidParams(format!(
            "{kind} name '{name}' must be non-empty and must not contain '/'"
        )));
    }
    Ok(())
}

impl Provider for QemuProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> ProviderConfig {
        ProviderConfig {
            use_partition_tables: false,
        }
    }

    fn stage(&self, params: &StageImageParams) -> Result<Image, ProviderError> {
        require_name("image", &params.name)?;
        self.replace_existing_image(&params.name, params.force)?;

        let raw = &params.raw_image;
        let dir = self.layout.image_dir(&params.name);
        let copied = cleanup_on_error(
            self.copy_boot_files(&params.name, &raw.local_image_path, raw.stage_spec.image_format),
            params.no_cleanup,
            || {
                let _ = fs::remove_dir_all(&dir);
            },
        )
        .context("copying raw boot image")?;

        let mut run_spec = raw.run_spec.clone();
        if run_spec.mapping_for(ROOT_MOUNT_POINT).is_none() {
            run_spec
                .device_mappings
                .insert(0, RumpTarget::Qemu.root_mapping());
        }
        let image = Image {
            id: ImageId::new(params.name.as_str()),
            name: params.name.clone(),
            size_mb: copied.div_ceil(1 << 20),
            infrastructure: Infrastructure::Qemu,
            created: Utc::now(),
            stage_spec: raw.stage_spec.clone(),
            run_spec,
        };
        let recorded = self.state.modify_images(|images| {
            images.insert(image.id.clone(), image.clone());
            Ok::<_, StoreError>(())
        });
        cleanup_on_error(recorded.map_err(Into::into), params.no_cleanup, || {
            let _ = fs::remove_dir_all(&dir);
        })
        .context("modifying image map in state")?;

        info!(image = %image.id, size_mb = image.size_mb, "image staged");
        Ok(image)
    }

    fn list_images(&self) -> Result<Vec<Image>, ProviderError> {
        Ok(sorted(self.state.images()?.into_values().collect(), |i| {
            i.name.clone()
        }))
    }

    fn delete_image(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        let image = self.find_image(id)?;
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
                info!("force: deleting instance {} of image {}", instance.id, image.id);
                self.delete_instance(&instance.id, true)
                    .with_context(|| format!("deleting instance {}", instance.id))?;
            }
        }

        remove_dir_if_exists(&self.layout.image_dir(&image.name))?;
        self.state.remove_image(&image.id)?;
        if self.debug_target().as_deref() == Some(image.name.as_str()) {
            self.set_debug_target(None);
        }
        info!(image = %image.id, "image deleted");
        Ok(())
    }

    fn run_instance(&self, params: &RunInstanceParams) -> Result<Instance, ProviderError> {
        info!(
            image = %params.image_id,
            mounts = ?params.mount_points_to_volume_ids,
            env = ?params.env,
            "running instance {}",
            params.name
        );
        require_name("instance", &params.name)?;
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
        for volume in resolved.values() {
            if let Some(owner) = &volume.attachment {
                return Err(ProviderError::AlreadyAttached {
                    volume: volume.id.to_string(),
                    instance: owner.to_string(),
                });
            }
        }
        let volumes = ordered_volumes(&image, resolved)?;
        let args = self.instance_args(&image, params, &volumes)?;

        let instance_dir = self.layout.instance_dir(&params.name);
        fs::create_dir_all(&instance_dir)?;
        let spec = LaunchSpec {
            binary: self.config.qemu_binary.clone(),
            args,
            log_path: self.layout.instance_log_path(&params.name),
        };
        let pid = cleanup_on_error(self.driver.launch(&spec), params.no_cleanup, || {
            self.release_instance_dir(&params.name);
        })
        .context("can't start qemu - make sure it's in your path")?;

        if params.debug_mode {
            info!(
                "running instance in debug mode; attach a debugger to port {}",
                self.config.debugger_port
            );
            self.set_debug_target(Some(image.name.clone()));
        }

        let instance = Instance {
            id: InstanceId::new(pid.to_string()),
            name: params.name.clone(),
            state: InstanceState::Running,
            ip_address: String::new(),
            image_id: image.id.clone(),
            infrastructure: Infrastructure::Qemu,
            created: Utc::now(),
        };
        cleanup_on_error(
            self.record_instance(&instance, &volumes),
            params.no_cleanup,
            || {
                if let Err(e) = self.driver.kill(pid) {
                    warn!("cleanup: failed to kill pid {pid}: {e}");
                }
                self.release_instance_dir(&params.name);
            },
        )
        .context("modifying instance map in state")?;

        let instance = match &self.listener {
            Some(listener) => self.discover_ip(listener, instance),
            None => instance,
        };
        info!(instance = %instance.id, name = %instance.name, "instance created");
        Ok(instance)
    }

    /// Instances whose VMM process is gone are dropped from the ledger.
    fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let dead: Vec<Instance> = self
            .state
            .instances()?
            .into_values()
            .filter(|i| !self.is_alive(i))
            .collect();
        for instance in &dead {
            info!("instance {} ({}) is no longer running", instance.name, instance.id);
            self.state.remove_instance(&instance.id)?;
        }
        Ok(sorted(self.state.instances()?.into_values().collect(), |i| {
            i.name.clone()
        }))
    }

    fn delete_instance(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        let instance = self.find_instance(id)?;
        if self.is_alive(&instance) {
            if !force {
                return Err(ProviderError::InstanceRunning(instance.id.to_string()));
            }
            self.terminate(&instance)?;
        }
        self.forget_instance(&instance)?;
        info!(instance = %instance.id, "instance deleted");
        Ok(())
    }

    fn start_instance(&self, _id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "start instance",
            backend: self.config.name.clone(),
        })
    }

    fn stop_instance(&self, id: &str) -> Result<(), ProviderError> {
        let instance = self
            .find_instance(id)
            .with_context(|| format!("retrieving instance {id}"))?;
        self.terminate(&instance)?;
        self.forget_instance(&instance)?;
        info!(instance = %instance.id, "instance stopped");
        Ok(())
    }

    fn get_instance_logs(&self, id: &str) -> Result<String, ProviderError> {
        let instance = self.get_instance(id)?;
        let path = self.layout.instance_log_path(&instance.name);
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, ProviderError> {
        require_name("volume", &params.name)?;
        if params.image_path.is_none() && params.size_mb.unwrap_or(0) == 0 {
            return Err(ProviderError::InvalidParams(
                "a volume needs either an image path or a size".to_owned(),
            ));
        }
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

        let dir = self.layout.volume_dir(&params.name);
        let path = self.layout.volume_image_path(&params.name);
        let created = (|| -> Result<u64, ProviderError> {
            fs::create_dir_all(&dir)?;
            match (&params.image_path, params.size_mb) {
                (Some(source), _) => fs::copy(source, &path)
                    .with_context(|| format!("copying {}", source.display())),
                (None, size_mb) => {
                    let bytes = size_mb.unwrap_or(0) << 20;
                    File::create(&path)?.set_len(bytes)?;
                    Ok(bytes)
                }
            }
        })();
        let bytes = cleanup_on_error(created, params.no_cleanup, || {
            let _ = fs::remove_dir_all(&dir);
        })
        .context("creating volume image")?;

        let volume = Volume {
            id: VolumeId::new(params.name.as_str()),
            name: params.name.clone(),
            size_mb: bytes.div_ceil(1 << 20),
            attachment: None,
            mount_point: None,
            infrastructure: Infrastructure::Qemu,
            created: Utc::now(),
        };
        let recorded = self.state.modify_volumes(|volumes| {
            volumes.insert(volume.id.clone(), volume.clone());
            Ok::<_, StoreError>(())
        });
        cleanup_on_error(recorded.map_err(Into::into), params.no_cleanup, || {
            let _ = fs::remove_dir_all(&dir);
        })
        .context("modifying volume map in state")?;

        info!(volume = %volume.id, size_mb = volume.size_mb, "volume created");
        Ok(volume)
    }

    /// Attachments to instances that no longer exist are cleared.
    fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError> {
        let live: HashSet<InstanceId> = self
            .list_instances()?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let stale = self
            .state
            .volumes()?
            .values()
            .any(|v| v.attachment.as_ref().is_some_and(|a| !live.contains(a)));
        if stale {
            self.state.modify_volumes(|volumes| {
                for volume in volumes.values_mut() {
                    if volume.attachment.as_ref().is_some_and(|a| !live.contains(a)) {
                        debug!("clearing stale attachment of volume {}", volume.id);
                        volume.detach();
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
        remove_dir_if_exists(&self.layout.volume_dir(&volume.name))?;
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
        let port = controller_port_for_mount(&image, mount_point)?;
        debug!(
            "attaching volume {} to instance {} at {mount_point} (controller port {port})",
            volume.id, instance.id
        );

        self.state.modify_volumes(|volumes| {
            claim_mount_point(volumes, &volume.id, &instance.id, mount_point)
        })?;
        let attached = self
            .driver
            .hotplug_attach(
                &self.monitor_path(&instance.name),
                &drive_id(&volume),
                &self.layout.volume_image_path(&volume.name),
                port,
            )
            .with_context(|| format!("attaching volume {} to instance {}", volume.id, instance.id));
        if attached.is_err() {
            self.release_claim(&volume.id)?;
        }
        attached
    }

    fn detach_volume(&self, id: &str) -> Result<(), ProviderError> {
        let volume = self.find_volume(id)?;
        let Some(owner) = volume.attachment.clone() else {
            return Err(ProviderError::NotAttached(volume.id.to_string()));
        };
        match self.state.instance(&owner)? {
            Some(instance) if self.is_alive(&instance) => self
                .driver
                .hotplug_detach(&self.monitor_path(&instance.name), &drive_id(&volume))
                .with_context(|| format!("detaching volume {} from instance {owner}", volume.id))?,
            _ => debug!("instance {owner} is gone; clearing the attachment only"),
        }

        self.state.modify_volumes(|volumes| {
            let record = volumes.get_mut(volume.id.as_str()).ok_or_else(|| {
                ProviderError::StateInconsistent {
                    kind: "volume",
                    id: volume.id.to_string(),
                }
            })?;
            record.detach();
            Ok(())
        })
    }

    fn pull_image(&self, params: &PullImageParams) -> Result<(), ProviderError> {
        require_name("image", &params.image_name)?;
        self.replace_existing_image(&params.image_name, params.force)?;

        let client = HubClient::new(&params.config);
        let (record, archive) = client.pull(&params.image_name).context("pulling image")?;
        if record.image.infrastructure != Infrastructure::Qemu {
            return Err(ProviderError::InvalidParams(format!(
                "image {} was built for {}, not QEMU",
                params.image_name, record.image.infrastructure
            )));
        }

        let dir = self.layout.image_dir(&params.image_name);
        cleanup_on_error(unpack_image_dir(&archive, &dir), false, || {
            let _ = fs::remove_dir_all(&dir);
        })?;
        let image = Image {
            id: ImageId::new(params.image_name.as_str()),
            name: params.image_name.clone(),
            ..record.image
        };
        self.state.modify_images(|images| {
            images.insert(image.id.clone(), image.clone());
            Ok::<_, StoreError>(())
        })?;
        info!("image {} pulled successfully from {}", image.name, params.config.url);
        Ok(())
    }

    fn push_image(&self, params: &PushImageParams) -> Result<(), ProviderError> {
        let image = self
            .image_by_name(&params.image_name)?
            .ok_or_else(|| ProviderError::NotFound {
                kind: "image",
                query: params.image_name.clone(),
            })?;
        let archive = pack_image_dir(&self.layout.image_dir(&image.name))?;
        let record = HubClient::new(&params.config)
            .push(&image, &archive)
            .context("pushing image")?;
        info!(digest = %record.digest, "image {} pushed to {}", image.name, params.config.url);
        Ok(())
    }

    fn remote_delete_image(&self, params: &RemoteDeleteImageParams) -> Result<(), ProviderError> {
        HubClient::new(&params.config)
            .delete(&params.image_name)
            .context("deleting remote image")?;
        info!("image {} deleted from {}", params.image_name, params.config.url);
        Ok(())
    }
}
