use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use unikit_core::{spawn_reconciler, CoreError, DaemonLock, Providers};
use unikit_provider::{MockAuthority, MockProvider, Provider};
use unikit_schema::{
    CreateVolumeParams, DaemonConfig, MockConfig, RawImage, RunInstanceParams, StageImageParams,
};

fn mock(home: &Path, name: &str, authority: Arc<MockAuthority>) -> Arc<MockProvider> {
    let config = MockConfig {
        name: name.to_owned(),
        region: "local-1".to_owned(),
    };
    Arc::new(MockProvider::new(&config, home, authority).unwrap())
}

fn stage(provider: &dyn Provider, build: &Path, name: &str) {
    let raw = build.join(format!("{name}.img"));
    fs::write(&raw, b"unikernel").unwrap();
    provider
        .stage(&StageImageParams {
            name: name.to_owned(),
            raw_image: RawImage {
                local_image_path: raw,
                ..RawImage::default()
            },
            ..StageImageParams::default()
        })
        .unwrap();
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn reconciler_drops_instances_the_authority_forgot() {
    let home = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let authority = Arc::new(MockAuthority::with_boot_polls(0));
    let provider = mock(home.path(), "sim", Arc::clone(&authority));
    stage(provider.as_ref(), build.path(), "app");
    let instance = provider
        .run_instance(&RunInstanceParams {
            name: "web".to_owned(),
            image_id: "app".to_owned(),
            ..RunInstanceParams::default()
        })
        .unwrap();

    let state_file = home.path().join("sim").join("state.json");
    let recorded_instances = || -> usize {
        let ledger: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&state_file).unwrap()).unwrap();
        ledger["Instances"].as_object().map_or(0, serde_json::Map::len)
    };
    assert_eq!(recorded_instances(), 1);

    let handle = spawn_reconciler(provider.clone(), Duration::from_millis(10));
    assert_eq!(handle.provider(), "sim");
    wait_until("two passes", || handle.passes() >= 2);
    assert_eq!(recorded_instances(), 1, "a live instance survives reconciliation");

    authority.forget_instance(&instance.id);
    wait_until("the ledger to drop the instance", || recorded_instances() == 0);
    assert!(!handle.is_finished());
    handle.stop();
}

#[test]
fn stopped_reconciler_exits_promptly() {
    let home = tempfile::tempdir().unwrap();
    let provider = mock(home.path(), "sim", Arc::new(MockAuthority::new()));

    let handle = spawn_reconciler(provider, Duration::from_secs(3600));
    wait_until("the first pass", || handle.passes() >= 1);
    let started = Instant::now();
    handle.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn registry_finds_the_owning_provider() {
    let home = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let east = mock(home.path(), "east", Arc::new(MockAuthority::with_boot_polls(0)));
    let west = mock(home.path(), "west", Arc::new(MockAuthority::with_boot_polls(0)));

    let mut registry = Providers::new();
    registry.insert(east.clone()).unwrap();
    registry.insert(west.clone()).unwrap();

    stage(west.as_ref(), build.path(), "app");
    east.create_volume(&CreateVolumeParams {
        name: "scratch".to_owned(),
        size_mb: Some(4),
        ..CreateVolumeParams::default()
    })
    .unwrap();
    let instance = west
        .run_instance(&RunInstanceParams {
            name: "web".to_owned(),
            image_id: "app".to_owned(),
            ..RunInstanceParams::default()
        })
        .unwrap();

    assert_eq!(registry.provider_for_image("app").unwrap().name(), "west");
    assert_eq!(registry.provider_for_volume("scratch").unwrap().name(), "east");
    assert_eq!(
        registry.provider_for_instance(&instance.id).unwrap().name(),
        "west"
    );

    let err = registry.provider_for_image("missing").err().unwrap();
    assert!(err.is_not_found());
}

#[test]
fn registry_from_toml_config() {
    let home = tempfile::tempdir().unwrap();
    let config = DaemonConfig::parse(&format!(
        r#"
home = "{}"

[[providers.qemu]]
name = "local"

[[providers.mock]]
name = "sim"
"#,
        home.path().display()
    ))
    .unwrap();

    let registry = Providers::from_config(&config).unwrap();
    assert_eq!(registry.names(), vec!["local", "sim"]);
    assert!(home.path().join("local").join("volumes").is_dir());
    assert!(registry.provider_for_image("anything").err().unwrap().is_not_found());
}

#[test]
fn one_daemon_per_home() {
    let home = tempfile::tempdir().unwrap();
    let lock = home.path().join("daemon.lock");
    let _held = DaemonLock::try_acquire(&lock).unwrap();
    assert!(matches!(
        DaemonLock::try_acquire(&lock),
        Err(CoreError::DaemonRunning(_))
    ));
}
