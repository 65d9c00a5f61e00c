//! Rump boot descriptor assembly.
//!
//! The descriptor is built as a structured [`BootConfig`] and only turned into
//! the guest's quasi-JSON dialect at the serialization boundary by
//! [`BootConfig::to_rump_json`]. The guest parser wants:
//!
//! - one top-level `"blk"` key per block device instead of an array,
//! - a single `"net"` key,
//! - baked environment entries as repeated top-level `"env"` keys.

use crate::devices::{number_devices, RumpTarget};
use crate::ProviderError;
use serde::Serialize;
use std::collections::BTreeMap;
use unikit_schema::{
    ImageFormat, RunSpec, StageSpec, StorageDriver, VsphereNetworkType, XenVirtualizationType,
    RUMP_COMPILER,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Block {
    pub source: String,
    pub path: String,
    pub fstype: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub diskfile: String,
}

impl Block {
    pub fn dev(path: &str, mountpoint: &str) -> Self {
        Self::new("dev", path, mountpoint)
    }

    pub fn etfs(path: &str, mountpoint: &str) -> Self {
        Self::new("etfs", path, mountpoint)
    }

    fn new(source: &str, path: &str, mountpoint: &str) -> Self {
        Self {
            source: source.to_owned(),
            path: path.to_owned(),
            fstype: "blk".to_owned(),
            mountpoint: mountpoint.to_owned(),
            diskfile: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetMethod {
    Static,
    Dhcp,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NetConfig {
    #[serde(rename = "if", skip_serializing_if = "String::is_empty")]
    pub interface: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<NetMethod>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mask: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cloner: String,
}

impl NetConfig {
    pub fn dhcp(interface: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            kind: "inet".to_owned(),
            method: Some(NetMethod::Dhcp),
            ..Self::default()
        }
    }

    pub fn static_addr(interface: &str, addr: &str, mask: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            kind: "inet".to_owned(),
            method: Some(NetMethod::Static),
            addr: addr.to_owned(),
            mask: mask.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cloner(mut self) -> Self {
        self.cloner = "true".to_owned();
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandLine {
    pub bin: String,
    pub argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runmode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    pub rc: Vec<CommandLine>,
    pub net: Option<NetConfig>,
    pub net1: Option<NetConfig>,
    pub blk: Vec<Block>,
    /// Baked `KEY=VALUE` entries, in the order given.
    pub env: Vec<String>,
}

impl BootConfig {
    /// A run configuration that starts `program` with `argv`, optionally
    /// preceded by a bootstrap `stub` stage.
    pub fn for_program(argv: Vec<String>, add_stub: bool) -> Self {
        let mut rc = Vec::with_capacity(2);
        if add_stub {
            rc.push(CommandLine {
                bin: "stub".to_owned(),
                argv: Vec::new(),
                runmode: None,
            });
        }
        rc.push(CommandLine {
            bin: "program".to_owned(),
            argv,
            runmode: None,
        });
        Self {
            rc,
            ..Self::default()
        }
    }

    /// Bake `KEY=VALUE` pairs into the descriptor.
    #[must_use]
    pub fn with_env_pairs<S: AsRef<str>>(mut self, pairs: &[S]) -> Self {
        self.env.extend(pairs.iter().map(|pair| pair.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub fn with_network(mut self, net: NetConfig) -> Self {
        self.net = Some(net);
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: Block) -> Self {
        self.blk.push(block);
        self
    }

    /// Serialize into the guest's descriptor dialect.
    ///
    /// Every value goes through serde_json; only the repeated keys are
    /// written by hand, so user data is never rewritten.
    pub fn to_rump_json(&self) -> Result<String, ProviderError> {
        let mut entries = vec![format!("\"rc\":{}", serde_json::to_string(&self.rc)?)];
        for net in self.net.iter().chain(&self.net1) {
            entries.push(format!("\"net\":{}", serde_json::to_string(net)?));
        }
        for pair in &self.env {
            entries.push(env_entry(pair, "")?);
        }
        for block in &self.blk {
            entries.push(format!("\"blk\": {}", serde_json::to_string(block)?));
        }
        Ok(format!("{{{}}}", entries.join(",")))
    }
}

fn env_entry(pair: &str, separator: &str) -> Result<String, ProviderError> {
    Ok(format!("\"env\":{separator}{}", serde_json::to_string(pair)?))
}

/// Add run-time environment entries to a stored descriptor.
///
/// The descriptor is not parseable JSON, so entries are spliced in as
/// repeated top-level `"env"` keys just before the closing brace.
pub fn inject_env(cmdline: &str, env: &BTreeMap<String, String>) -> Result<String, ProviderError> {
    if env.is_empty() {
        return Ok(cmdline.to_owned());
    }
    let entries = env
        .iter()
        .map(|(k, v)| env_entry(&format!("{k}={v}"), " "))
        .collect::<Result<Vec<_>, _>>()?;
    let trimmed = cmdline.trim_end();
    let Some(body) = trimmed.strip_suffix('}') else {
        return Err(ProviderError::InvalidParams(
            "stored boot descriptor is not an object".to_owned(),
        ));
    };
    let separator = if body.trim_end().ends_with('{') { "" } else { "," };
    Ok(format!("{body}{separator}{}}}", entries.join(",")))
}

/// A compiled rump image's boot descriptor and specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RumpImage {
    pub cmdline: String,
    pub run_spec: RunSpec,
    pub stage_spec: StageSpec,
}

/// Build the boot descriptor and device mappings for a rump kernel.
///
/// `args` is split on single spaces into the program's argv. `baked_env`
/// holds `KEY=VALUE` pairs fixed at compile time.
pub fn assemble_rump<S: AsRef<str>, E: AsRef<str>>(
    target: RumpTarget,
    args: &str,
    mount_points: &[S],
    baked_env: &[E],
    add_stub: bool,
) -> Result<RumpImage, ProviderError> {
    let argv: Vec<String> = if args.is_empty() {
        Vec::new()
    } else {
        args.split(' ').map(str::to_owned).collect()
    };

    let (device_mappings, blocks) = number_devices(target, mount_points)?;

    let mut config = BootConfig::for_program(argv, add_stub)
        .with_env_pairs(baked_env)
        .with_network(target.network());
    for block in blocks {
        config = config.with_block(block);
    }
    let cmdline = config.to_rump_json()?;
    tracing::debug!("assembled rump descriptor: {cmdline}");

    let mut run_spec = RunSpec {
        device_mappings,
        default_instance_memory: target.default_memory(),
        compiler: RUMP_COMPILER.to_owned(),
        ..RunSpec::default()
    };
    let mut stage_spec = StageSpec {
        image_format: ImageFormat::Raw,
        xen_virtualization_type: None,
    };
    match target {
        RumpTarget::Qemu => {}
        RumpTarget::Vmware => {
            run_spec.storage_driver = Some(StorageDriver::Scsi);
            run_spec.vsphere_network_type = Some(VsphereNetworkType::E1000);
        }
        RumpTarget::Xen => {
            stage_spec.xen_virtualization_type = Some(XenVirtualizationType::Paravirtual);
        }
    }

    Ok(RumpImage {
        cmdline,
        run_spec,
        stage_spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_descriptor() {
        let config = BootConfig::for_program(vec!["-v".to_owned()], false);
        assert_eq!(
            config.to_rump_json().unwrap(),
            r#"{"rc":[{"bin":"program","argv":["-v"]}]}"#
        );
    }

    #[test]
    fn stub_precedes_program() {
        let config = BootConfig::for_program(Vec::new(), true);
        assert_eq!(
            config.to_rump_json().unwrap(),
            r#"{"rc":[{"bin":"stub","argv":[]},{"bin":"program","argv":[]}]}"#
        );
    }

    #[test]
    fn blocks_become_repeated_top_level_keys() {
        let config = BootConfig::for_program(Vec::new(), false)
            .with_block(Block::dev("/dev/ld0e", "/bootpart"))
            .with_block(Block::dev("/dev/ld1a", "/data"));
        assert_eq!(
            config.to_rump_json().unwrap(),
            concat!(
                r#"{"rc":[{"bin":"program","argv":[]}],"#,
                r#""blk": {"source":"dev","path":"/dev/ld0e","fstype":"blk","mountpoint":"/bootpart"},"#,
                r#""blk": {"source":"dev","path":"/dev/ld1a","fstype":"blk","mountpoint":"/data"}}"#
            )
        );
    }

    #[test]
    fn baked_env_is_flattened() {
        let config = BootConfig::for_program(Vec::new(), false)
            .with_env_pairs(&["A=1", "B=2"])
            .with_network(NetConfig::dhcp("vioif0"));
        assert_eq!(
            config.to_rump_json().unwrap(),
            concat!(
                r#"{"rc":[{"bin":"program","argv":[]}],"#,
                r#""net":{"if":"vioif0","type":"inet","method":"dhcp"},"#,
                r#""env":"A=1","env":"B=2"}"#
            )
        );
    }

    #[test]
    fn second_interface_is_also_keyed_net() {
        let mut config = BootConfig::for_program(Vec::new(), false)
            .with_network(NetConfig::dhcp("vioif0"));
        config.net1 = Some(NetConfig::dhcp("wm0"));
        assert_eq!(
            config.to_rump_json().unwrap(),
            concat!(
                r#"{"rc":[{"bin":"program","argv":[]}],"#,
                r#""net":{"if":"vioif0","type":"inet","method":"dhcp"},"#,
                r#""net":{"if":"wm0","type":"inet","method":"dhcp"}}"#
            )
        );
    }

    #[test]
    fn env_entries_keep_their_order() {
        let pairs: Vec<String> = (0..11).map(|i| format!("K{i}=v")).collect();
        let json = BootConfig::for_program(Vec::new(), false)
            .with_env_pairs(&pairs)
            .to_rump_json()
            .unwrap();
        assert_eq!(json.matches("\"env\":").count(), 11);
        let k2 = json.find("K2=v").unwrap();
        let k10 = json.find("K10=v").unwrap();
        assert!(k2 < k10);
    }

    #[test]
    fn user_data_is_never_rewritten() {
        let argv = vec!["-subnet1".to_owned(), "/srv/env2".to_owned(), "{net3}".to_owned()];
        let json = BootConfig::for_program(argv, false)
            .with_env_pairs(&["A={x}", "B=env9", "C=say \"hi\""])
            .to_rump_json()
            .unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"rc":[{"bin":"program","argv":["-subnet1","/srv/env2","{net3}"]}],"#,
                r#""env":"A={x}","env":"B=env9","env":"C=say \"hi\""}"#
            )
        );
    }

    #[test]
    fn static_network() {
        let json = BootConfig::for_program(Vec::new(), false)
            .with_network(NetConfig::static_addr("vioif0", "10.0.0.5", "24"))
            .to_rump_json()
            .unwrap();
        assert!(json.contains(
            r#""net":{"if":"vioif0","type":"inet","method":"static","addr":"10.0.0.5","mask":"24"}"#
        ));
    }

    #[test]
    fn inject_env_appends_top_level_entries() {
        let cmdline = r#"{"rc":[],"blk": {"source":"dev","path":"/dev/ld0e","fstype":"blk"}}"#;
        let mut env = BTreeMap::new();
        env.insert("FOO".to_owned(), "bar".to_owned());
        env.insert("BAZ".to_owned(), "1".to_owned());
        assert_eq!(
            inject_env(cmdline, &env).unwrap(),
            r#"{"rc":[],"blk": {"source":"dev","path":"/dev/ld0e","fstype":"blk"},"env": "BAZ=1","env": "FOO=bar"}"#
        );
    }

    #[test]
    fn inject_empty_env_is_identity() {
        let cmdline = r#"{"rc":[]}"#;
        assert_eq!(inject_env(cmdline, &BTreeMap::new()).unwrap(), cmdline);
    }

    #[test]
    fn inject_env_into_empty_object() {
        let mut env = BTreeMap::new();
        env.insert("A".to_owned(), "b".to_owned());
        assert_eq!(inject_env("{}", &env).unwrap(), r#"{"env": "A=b"}"#);
    }

    #[test]
    fn injected_values_are_escaped() {
        let mut env = BTreeMap::new();
        env.insert("MSG".to_owned(), r#"say "hi" \o/"#.to_owned());
        assert_eq!(
            inject_env(r#"{"rc":[]}"#, &env).unwrap(),
            r#"{"rc":[],"env": "MSG=say \"hi\" \\o/"}"#
        );
    }

    #[test]
    fn inject_into_non_object_fails() {
        let mut env = BTreeMap::new();
        env.insert("A".to_owned(), "b".to_owned());
        assert!(inject_env("console=ttyS0", &env).is_err());
    }

    #[test]
    fn assemble_qemu_image() {
        let image = assemble_rump(RumpTarget::Qemu, "-port 80", &["/data"], &["MODE=prod"], false)
            .unwrap();
        assert_eq!(
            image.cmdline,
            concat!(
                r#"{"rc":[{"bin":"program","argv":["-port","80"]}],"#,
                r#""net":{"if":"vioif0","type":"inet","method":"dhcp"},"#,
                r#""env":"MODE=prod","#,
                r#""blk": {"source":"dev","path":"/dev/ld0e","fstype":"blk","mountpoint":"/bootpart"},"#,
                r#""blk": {"source":"dev","path":"/dev/ld1a","fstype":"blk","mountpoint":"/data"}}"#
            )
        );
        assert_eq!(image.run_spec.device_mappings.len(), 2);
        assert!(image.run_spec.device_mappings[0].is_root());
        assert_eq!(image.run_spec.default_instance_memory, 512);
        assert!(image.run_spec.is_rump());
    }

    #[test]
    fn assemble_vmware_and_xen_specs() {
        let vmware = assemble_rump::<&str, &str>(RumpTarget::Vmware, "", &[], &[], true).unwrap();
        assert_eq!(vmware.run_spec.storage_driver, Some(StorageDriver::Scsi));
        assert_eq!(vmware.run_spec.default_instance_memory, 256);
        assert!(vmware.cmdline.starts_with(r#"{"rc":[{"bin":"stub","argv":[]}"#));

        let xen = assemble_rump(RumpTarget::Xen, "", &["/data"], &[] as &[&str], false).unwrap();
        assert_eq!(
            xen.stage_spec.xen_virtualization_type,
            Some(XenVirtualizationType::Paravirtual)
        );
        assert!(xen.cmdline.contains(r#""net":{"if":"xenif0","type":"inet","method":"dhcp","cloner":"true"}"#));
        assert!(xen.cmdline.contains(r#""blk": {"source":"etfs","path":"sdb1","fstype":"blk","mountpoint":"/data"}"#));
    }
}
