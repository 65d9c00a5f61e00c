//! Process-level control of VMM instances.
//!
//! `VmmDriver` is the seam between the qemu backend's bookkeeping and the
//! host: spawning the hypervisor, liveness, termination, and hot-plugging
//! block devices through the QEMU machine protocol (QMP).

use crate::ProviderError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const QMP_TIMEOUT: Duration = Duration::from_secs(5);

/// PCI slot of controller port 0. Ports map to consecutive slots from here.
const FIRST_DISK_SLOT: usize = 0x10;

/// PCI address of the block device on controller `port`.
pub fn disk_slot(port: usize) -> String {
    format!("{:#x}", FIRST_DISK_SLOT + port)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary: String,
    pub args: Vec<String>,
    /// Receives the VMM's stdout and stderr.
    pub log_path: PathBuf,
}

pub trait VmmDriver: Send + Sync {
    /// Start the VMM detached and return its pid.
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, ProviderError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Terminate the VMM. Killing a pid that is already gone succeeds.
    fn kill(&self, pid: u32) -> Result<(), ProviderError>;

    /// Add `file` as a virtio block device with id `drive_id` on controller
    /// `port` of the running VMM reachable through `monitor`.
    fn hotplug_attach(
        &self,
        monitor: &Path,
        drive_id: &str,
        file: &Path,
        port: usize,
    ) -> Result<(), ProviderError>;

    fn hotplug_detach(&self, monitor: &Path, drive_id: &str) -> Result<(), ProviderError>;
}

/// Runs VMMs as child processes of the daemon.
#[derive(Default)]
pub struct ProcessDriver {
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self) -> Result<MutexGuard<'_, HashMap<u32, Child>>, ProviderError> {
        self.children
            .lock()
            .map_err(|e| ProviderError::backend("vmm", format!("lock poisoned: {e}")))
    }
}

impl VmmDriver for ProcessDriver {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, ProviderError> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = File::create(&spec.log_path)?;
        let stderr = stdout.try_clone()?;
        tracing::debug!("running {} {}", spec.binary, spec.args.join(" "));
        let child = Command::new(&spec.binary)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| ProviderError::backend(format!("starting {}", spec.binary), e))?;
        let pid = child.id();
        self.children()?.insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        if let Ok(mut children) = self.children() {
            if let Some(child) = children.get_mut(&pid) {
                return match child.try_wait() {
                    Ok(None) => true,
                    _ => {
                        children.remove(&pid);
                        false
                    }
                };
            }
        }
        signal(pid, 0).is_ok()
    }

    fn kill(&self, pid: u32) -> Result<(), ProviderError> {
        let child = self.children()?.remove(&pid);
        if let Some(mut child) = child {
            if let Err(e) = child.kill() {
                tracing::debug!("pid {pid} already exited: {e}");
            }
            child.wait()?;
            return Ok(());
        }
        match signal(pid, libc::SIGKILL) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                tracing::debug!("pid {pid} already exited before SIGKILL");
                Ok(())
            }
            Err(e) => Err(ProviderError::backend(format!("killing pid {pid}"), e)),
        }
    }

    fn hotplug_attach(
        &self,
        monitor: &Path,
        drive_id: &str,
        file: &Path,
        port: usize,
    ) -> Result<(), ProviderError> {
        let mut qmp = Qmp::connect(monitor)?;
        qmp.human(&format!(
            "drive_add 0 if=none,id={drive_id},file={},format=raw",
            file.display()
        ))?;
        qmp.human(&format!(
            "device_add virtio-blk-pci,drive={drive_id},id=dev-{drive_id},addr={}",
            disk_slot(port)
        ))
    }

    fn hotplug_detach(&self, monitor: &Path, drive_id: &str) -> Result<(), ProviderError> {
        let mut qmp = Qmp::connect(monitor)?;
        qmp.human(&format!("device_del dev-{drive_id}"))?;
        qmp.human(&format!("drive_del {drive_id}"))
    }
}

#[allow(unsafe_code)]
fn signal(pid: u32, sig: libc::c_int) -> Result<(), std::io::Error> {
    let pid = i32::try_from(pid).map_err(|_| std::io::Error::other(format!("invalid pid {pid}")))?;
    // SAFETY: kill() with a validated pid has no memory-safety preconditions;
    // signal 0 only checks for existence.
    let ret = unsafe { libc::kill(pid, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// A QMP session on a unix socket. Messages are newline-delimited JSON.
struct Qmp {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Qmp {
    fn connect(path: &Path) -> Result<Self, ProviderError> {
        let stream = UnixStream::connect(path).map_err(|e| {
            ProviderError::backend(format!("connecting to monitor {}", path.display()), e)
        })?;
        stream.set_read_timeout(Some(QMP_TIMEOUT))?;
        let writer = stream.try_clone()?;
        let mut qmp = Self {
            reader: BufReader::new(stream),
            writer,
        };
        let greeting = qmp.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(ProviderError::backend("qmp", format!("unexpected greeting: {greeting}")));
        }
        qmp.execute(&json!({ "execute": "qmp_capabilities" }))?;
        Ok(qmp)
    }

    fn read_message(&mut self) -> Result<Value, ProviderError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ProviderError::backend("qmp", "monitor closed the connection"));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Send a command and wait for its reply, skipping async events.
    fn execute(&mut self, command: &Value) -> Result<Value, ProviderError> {
        tracing::trace!("qmp -> {command}");
        writeln!(self.writer, "{command}")?;
        loop {
            let reply = self.read_message()?;
            tracing::trace!("qmp <- {reply}");
            if reply.get("event").is_some() {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(ProviderError::backend("qmp", error));
            }
            return Ok(reply.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    /// Run a monitor command through `human-monitor-command`. Errors of the
    /// human monitor come back as non-empty output.
    fn human(&mut self, command_line: &str) -> Result<(), ProviderError> {
        let output = self.execute(&json!({
            "execute": "human-monitor-command",
            "arguments": { "command-line": command_line },
        }))?;
        match output.as_str() {
            Some(text) if !text.trim().is_empty() => Err(ProviderError::backend(
                format!("qmp {command_line}"),
                text.trim(),
            )),
            _ => Ok(()),
        }
    }
}
