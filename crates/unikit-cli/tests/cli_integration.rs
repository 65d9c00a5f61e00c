//! CLI subprocess integration tests.
//!
//! These tests invoke the `unikit` binary against a throwaway home and check
//! exit codes, table output, and JSON shapes. The qemu provider only needs a
//! VMM to boot instances, so staging and volume management run without one.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Env {
    home: tempfile::TempDir,
    config: PathBuf,
}

impl Env {
    fn new(providers: &str) -> Self {
        let home = tempfile::tempdir().unwrap();
        let config = home.path().join("daemon.toml");
        std::fs::write(
            &config,
            format!(
                "home = \"{}\"\n\n{providers}",
                home.path().join("state").display()
            ),
        )
        .unwrap();
        Self { home, config }
    }

    fn local() -> Self {
        Self::new("[[providers.qemu]]\nname = \"local\"\n")
    }

    fn unikit(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_unikit"))
            .env("HOME", self.home.path())
            .env_remove("UNIKIT_LOG")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let mut all = vec!["--json"];
        all.extend_from_slice(args);
        let output = self.unikit(&all);
        assert!(output.status.success(), "{args:?} failed: {}", stderr(&output));
        serde_json::from_slice(&output.stdout)
            .unwrap_or_else(|e| panic!("{args:?} printed invalid JSON ({e}): {}", stdout(&output)))
    }

    fn disk(&self, name: &str) -> PathBuf {
        let path = self.home.path().join(name);
        std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();
        path
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_unikit"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("unikit"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_unikit"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let help = stdout(&output);
    for command in ["stage", "run", "attach-volume", "pull", "daemon"] {
        assert!(help.contains(command), "help must list '{command}'");
    }
}

#[test]
fn completions_do_not_need_a_config() {
    let output = Command::new(env!("CARGO_BIN_EXE_unikit"))
        .args(["--config", "/nonexistent/daemon.toml", "completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("unikit"));
}

#[test]
fn man_pages_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("man");
    let output = Command::new(env!("CARGO_BIN_EXE_unikit"))
        .args(["man-pages", path_arg(&out)])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(out.join("unikit.1").is_file());
    assert!(out.join("unikit-run.1").is_file());
}

#[test]
fn providers_lists_configured_backends() {
    let env = Env::new("[[providers.qemu]]\nname = \"local\"\n\n[[providers.mock]]\nname = \"sim\"\n");
    let listed = env.json(&["providers"]);
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["local", "sim"]);
    assert_eq!(listed[1]["use_partition_tables"], true);
}

#[test]
fn bad_config_exits_with_config_error() {
    let env = Env::new("colour = \"blue\"\n");
    let output = env.unikit(&["images"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("config error"));
}

#[test]
fn creating_with_two_providers_needs_a_choice() {
    let env = Env::new("[[providers.qemu]]\nname = \"a\"\n\n[[providers.qemu]]\nname = \"b\"\n");
    let output = env.unikit(&["create-volume", "data", "--size", "4"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("--provider"));

    let output = env.unikit(&["--provider", "b", "create-volume", "data", "--size", "4"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let volumes = env.json(&["volumes"]);
    assert!(volumes["a"].as_array().unwrap().is_empty());
    assert_eq!(volumes["b"][0]["Name"], "data");
}

#[test]
fn unknown_image_exits_not_found() {
    let env = Env::local();
    let output = env.unikit(&["image", "ghost"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("ghost"));
}

#[test]
fn stage_list_and_delete_image() {
    let env = Env::local();
    let disk = env.disk("disk.img");
    let output = env.unikit(&[
        "stage",
        "app",
        "--image",
        path_arg(&disk),
        "--mount",
        "/data",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));

    let images = env.json(&["images"]);
    let app = &images["local"][0];
    assert_eq!(app["Name"], "app");
    assert_eq!(app["SizeMb"], 1);

    let table = stdout(&env.unikit(&["images"]));
    assert!(table.contains("PROVIDER"));
    assert!(table.contains("/data"));

    let shown = env.json(&["image", "app"]);
    assert_eq!(shown["RunSpec"]["DeviceMappings"][1]["MountPoint"], "/data");

    let output = env.unikit(&["stage", "app", "--image", path_arg(&disk)]);
    assert!(!output.status.success(), "restaging without --force must fail");
    let output = env.unikit(&["stage", "app", "--image", path_arg(&disk), "--force"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let output = env.unikit(&["delete-image", "app"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(env.json(&["images"])["local"].as_array().unwrap().is_empty());
}

#[test]
fn rump_stage_writes_boot_descriptor() {
    let env = Env::local();
    let disk = env.disk("disk.img");
    let kernel = env.disk("app.bin");
    let output = env.unikit(&[
        "stage",
        "svc",
        "--image",
        path_arg(&disk),
        "--kernel",
        path_arg(&kernel),
        "--rump",
        "qemu",
        "--args",
        "-port 80",
        "--env",
        "MODE=prod",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));

    let image_dir = env.home.path().join("state/local/images/svc");
    assert!(image_dir.join("program.bin").is_file());
    let cmdline = std::fs::read_to_string(image_dir.join("cmdline")).unwrap();
    assert!(cmdline.contains("MODE=prod"));
    assert_eq!(env.json(&["image", "svc"])["RunSpec"]["Compiler"], "rump");
}

#[test]
fn volume_lifecycle_from_size_and_data() {
    let env = Env::local();
    let data = env.disk("seed.img");

    let created = env.json(&["create-volume", "scratch", "--size", "4"]);
    assert_eq!(created["SizeMb"], 4);
    let seeded = env.json(&["create-volume", "seeded", "--data", path_arg(&data)]);
    assert_eq!(seeded["SizeMb"], 1);

    let output = env.unikit(&["create-volume", "scratch", "--size", "4"]);
    assert!(!output.status.success(), "duplicate volume name must fail");

    let table = stdout(&env.unikit(&["volumes"]));
    assert!(table.contains("scratch"));
    assert!(table.contains("seeded"));

    let output = env.unikit(&["detach-volume", "scratch"]);
    assert!(!output.status.success(), "detaching an unattached volume must fail");

    let output = env.unikit(&["delete-volume", "scratch"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let volumes = env.json(&["volumes"]);
    assert_eq!(volumes["local"].as_array().unwrap().len(), 1);
}

#[test]
fn run_rejects_malformed_bindings_before_touching_a_backend() {
    let env = Env::local();
    let output = env.unikit(&["run", "web", "--image", "app", "--vol", "no-separator"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("volumeId:mountPoint"));
}

#[test]
fn hub_commands_need_a_hub_url() {
    let env = Env::local();
    let output = env.unikit(&["pull", "app"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("--hub-url"));
}
