use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use unikit_provider::{Backoff, MockAuthority, MockProvider, Provider, ProviderError};
use unikit_schema::{
    CreateVolumeParams, DeviceMapping, Instance, InstanceState, MockConfig, RawImage,
    RunInstanceParams, RunSpec, StageImageParams, Volume,
};

struct Cloud {
    _home: TempDir,
    build: TempDir,
    authority: Arc<MockAuthority>,
    provider: MockProvider,
}

fn quick() -> Backoff {
    Backoff::default()
        .initial(Duration::from_millis(1))
        .max_interval(Duration::from_millis(5))
        .ceiling(Duration::from_secs(2))
}

fn cloud_with(authority: MockAuthority, backoff: Backoff) -> Cloud {
    let home = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let authority = Arc::new(authority);
    let config = MockConfig {
        name: "mock".to_owned(),
        region: "local-1".to_owned(),
    };
    let provider = MockProvider::new(&config, home.path(), Arc::clone(&authority))
        .unwrap()
        .with_backoff(backoff);
    let cloud = Cloud {
        _home: home,
        build,
        authority,
        provider,
    };
    cloud.stage("app");
    cloud
}

fn cloud() -> Cloud {
    cloud_with(MockAuthority::with_boot_polls(2), quick())
}

impl Cloud {
    fn stage(&self, name: &str) -> String {
        let raw = self.build.path().join(format!("{name}.img"));
        fs::write(&raw, vec![0u8; 1 << 20]).unwrap();
        self.provider
            .stage(&StageImageParams {
                name: name.to_owned(),
                raw_image: RawImage {
                    local_image_path: raw,
                    run_spec: RunSpec {
                        device_mappings: vec![
                            DeviceMapping::new("/data", "/dev/sdb"),
                            DeviceMapping::new("/logs", "/dev/sdc"),
                        ],
                        ..RunSpec::default()
                    },
                    ..RawImage::default()
                },
                ..StageImageParams::default()
            })
            .unwrap()
            .id
            .to_string()
    }

    fn volume(&self, name: &str) -> String {
        self.provider
            .create_volume(&CreateVolumeParams {
                name: name.to_owned(),
                size_mb: Some(8),
                ..CreateVolumeParams::default()
            })
            .unwrap()
            .id
            .to_string()
    }

    fn params(&self, name: &str, data: &str, logs: &str) -> RunInstanceParams {
        let mut mounts = BTreeMap::new();
        mounts.insert("/data".to_owned(), data.to_owned());
        mounts.insert("/logs".to_owned(), logs.to_owned());
        RunInstanceParams {
            name: name.to_owned(),
            image_id: "app".to_owned(),
            mount_points_to_volume_ids: mounts,
            ..RunInstanceParams::default()
        }
    }

    fn run(&self, name: &str) -> Instance {
        let data = self.volume(&format!("{name}-data"));
        let logs = self.volume(&format!("{name}-logs"));
        self.provider
            .run_instance(&self.params(name, &data, &logs))
            .unwrap()
    }
}

#[test]
fn staged_image_gets_authority_id_and_root_mapping() {
    let c = cloud();
    let image = c.provider.get_image("app").unwrap();
    assert!(image.id.starts_with("ami-"));
    assert_eq!(image.size_mb, 1);
    assert_eq!(
        image.run_spec.device_mappings[0],
        DeviceMapping::new("/", "/dev/sda1")
    );
    assert!(c.provider.config().use_partition_tables);
}

#[test]
fn run_waits_for_running_and_attaches_by_device() {
    let c = cloud();
    let instance = c.run("web");
    assert!(instance.id.starts_with("i-"));
    assert_eq!(instance.state, InstanceState::Running);
    assert!(instance.ip_address.starts_with("10.0."));

    let data = c.provider.get_volume("web-data").unwrap();
    assert!(data.is_attached_to(&instance.id));
    assert_eq!(
        c.authority.volume_device(&data.id).unwrap().as_deref(),
        Some("/dev/sdb")
    );
    let logs = c.provider.get_volume("web-logs").unwrap();
    assert_eq!(
        c.authority.volume_device(&logs.id).unwrap().as_deref(),
        Some("/dev/sdc")
    );
    assert!(c
        .provider
        .get_instance_logs("web")
        .unwrap()
        .contains("network up"));
}

#[test]
fn listing_reconciles_with_the_authority() {
    let c = cloud();
    let gone = c.run("gone");
    let paused = c.run("paused");

    c.authority.forget_instance(&gone.id);
    c.authority.set_instance_state(&paused.id, InstanceState::Stopped);

    let listed = c.provider.list_instances().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, paused.id);
    assert_eq!(listed[0].state, InstanceState::Stopped);
    assert!(!c.provider.get_volume("gone-data").unwrap().is_attached());

    let image = c.provider.get_image("app").unwrap();
    c.authority.deregister_image(&image.id).unwrap();
    assert!(c.provider.list_images().unwrap().is_empty());
}

#[test]
fn boot_timeout_cleans_up_unless_asked_not_to() {
    let c = cloud_with(
        MockAuthority::with_boot_polls(u32::MAX),
        quick().ceiling(Duration::from_millis(30)),
    );
    let data = c.volume("d");
    let logs = c.volume("l");

    let err = c
        .provider
        .run_instance(&c.params("slow", &data, &logs))
        .unwrap_err();
    assert!(matches!(err, ProviderError::Timeout { .. }));
    assert!(c.provider.list_instances().unwrap().is_empty());
    let ids = c.authority.instance_ids().unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(
        c.authority.describe_instance(&ids[0]).unwrap().unwrap().0,
        InstanceState::Terminated
    );
    // Terminating released the volumes.
    assert!(!c.provider.get_volume("d").unwrap().is_attached());

    let mut keep = c.params("kept", &data, &logs);
    keep.no_cleanup = true;
    c.provider.run_instance(&keep).unwrap_err();
    let pending = c
        .authority
        .instance_ids()
        .unwrap()
        .into_iter()
        .filter(|id| {
            c.authority.describe_instance(id).unwrap().unwrap().0 == InstanceState::Pending
        })
        .count();
    assert_eq!(pending, 1);
}

#[test]
fn backend_failure_leaves_the_ledger_untouched() {
    let c = cloud();
    let web = c.run("web");
    let spare = c.volume("spare");

    c.authority.fail_next("attach volume");
    let err = c
        .provider
        .attach_volume(&spare, "web", "/data")
        .unwrap_err();
    assert!(matches!(err.root(), ProviderError::Backend { .. }));
    assert!(!c.provider.get_volume("spare").unwrap().is_attached());

    c.authority.fail_next("create volume");
    assert!(c
        .provider
        .create_volume(&CreateVolumeParams {
            name: "never".to_owned(),
            size_mb: Some(1),
            ..CreateVolumeParams::default()
        })
        .is_err());
    assert!(c.provider.get_volume("never").unwrap_err().is_not_found());

    c.authority.fail_next("terminate instance");
    assert!(c.provider.delete_instance(&web.id, true).is_err());
    assert_eq!(c.provider.list_instances().unwrap().len(), 1);
}

#[test]
fn attach_detach_then_attach_elsewhere() {
    let c = cloud();
    let i1 = c.run("i1");
    let i2 = c.run("i2");
    let v1 = c.volume("v1");

    c.provider.detach_volume("i1-logs").unwrap();
    c.provider.attach_volume("v1", &i1.id, "/logs").unwrap();
    assert!(c.provider.get_volume("v1").unwrap().is_attached_to(&i1.id));

    c.provider.detach_volume("v1").unwrap();
    assert!(!c.provider.get_volume("v1").unwrap().is_attached());

    c.provider.detach_volume("i2-logs").unwrap();
    c.provider.attach_volume(&v1, &i2.id, "/logs").unwrap();
    assert!(c.provider.get_volume("v1").unwrap().is_attached_to(&i2.id));
    assert_eq!(
        c.authority.volume_device(&v1).unwrap().as_deref(),
        Some("/dev/sdc")
    );
}

#[test]
fn stop_and_start_round_trip() {
    let c = cloud();
    let web = c.run("web");

    c.provider.stop_instance("web").unwrap();
    assert_eq!(c.provider.get_instance("web").unwrap().state, InstanceState::Stopped);
    c.provider.start_instance("web").unwrap();
    assert_eq!(c.provider.get_instance("web").unwrap().state, InstanceState::Running);

    let err = c.provider.delete_instance(&web.id, false).unwrap_err();
    assert!(matches!(err, ProviderError::InstanceRunning(_)));
    // A stopped instance can be deleted without force.
    c.provider.stop_instance("web").unwrap();
    c.provider.delete_instance(&web.id, false).unwrap();
    assert!(c.provider.list_instances().unwrap().is_empty());
    assert!(!c.provider.get_volume("web-data").unwrap().is_attached());
}

#[test]
fn delete_image_cascades_with_force() {
    let c = cloud();
    c.run("a");
    c.run("b");

    let err = c.provider.delete_image("app", false).unwrap_err();
    assert!(matches!(err, ProviderError::ImageInUse { count: 2, .. }));

    c.provider.delete_image("app", true).unwrap();
    assert!(c.provider.list_instances().unwrap().is_empty());
    assert!(c.provider.list_images().unwrap().is_empty());
    assert!(c.authority.image_ids().unwrap().is_empty());
}

#[test]
fn delete_attached_volume_needs_force() {
    let c = cloud();
    c.run("web");

    let err = c.provider.delete_volume("web-data", false).unwrap_err();
    assert!(matches!(err, ProviderError::VolumeInUse { .. }));
    c.provider.delete_volume("web-data", true).unwrap();
    assert!(c.provider.get_volume("web-data").unwrap_err().is_not_found());
}

#[test]
fn ambiguous_lookup_is_rejected() {
    let c = cloud();
    c.volume("data-a");
    c.volume("data-b");
    let err = c.provider.get_volume("data-").unwrap_err();
    assert!(matches!(err, ProviderError::Ambiguous { .. }));
    assert_eq!(c.provider.get_volume("data-a").unwrap().size_mb, 8);
}

#[test]
fn concurrent_runs_with_same_name_keep_one() {
    let c = cloud();
    let first = c.params("web", &c.volume("a-data"), &c.volume("a-logs"));
    let second = c.params("web", &c.volume("b-data"), &c.volume("b-logs"));
    let barrier = Barrier::new(2);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|params| {
                let (provider, barrier) = (&c.provider, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    provider.run_instance(params)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err.root(), ProviderError::NameConflict { .. }));

    let live = c
        .authority
        .instance_ids()
        .unwrap()
        .into_iter()
        .filter(|id| {
            !matches!(
                c.authority.describe_instance(id).unwrap(),
                None | Some((InstanceState::Terminated, _))
            )
        })
        .count();
    assert_eq!(live, 1, "the losing instance is terminated");
    assert_eq!(c.provider.list_instances().unwrap().len(), 1);
    let attached = c
        .provider
        .list_volumes()
        .unwrap()
        .into_iter()
        .filter(Volume::is_attached)
        .count();
    assert_eq!(attached, 2);
}

#[test]
fn occupied_mount_point_rejects_a_second_volume() {
    let c = cloud();
    let web = c.run("web");
    let v1 = c.volume("v1");

    let err = c.provider.attach_volume("v1", &web.id, "/data").unwrap_err();
    assert!(matches!(err, ProviderError::MountPointInUse { .. }));
    assert!(!c.provider.get_volume("v1").unwrap().is_attached());
    assert_eq!(c.authority.volume_device(&v1).unwrap(), None);

    c.provider.detach_volume("web-logs").unwrap();
    c.provider.attach_volume("v1", &web.id, "/logs").unwrap();
    let attached = c.provider.get_volume("v1").unwrap();
    assert!(attached.is_attached_to(&web.id));
    assert_eq!(attached.mount_point.as_deref(), Some("/logs"));
    assert_eq!(
        c.authority.volume_device(&v1).unwrap().as_deref(),
        Some("/dev/sdc")
    );
}
