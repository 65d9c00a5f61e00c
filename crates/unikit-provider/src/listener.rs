//! Discovery of instance IP addresses.
//!
//! Unikernels compiled with the instance-listener stub broadcast
//! `<mac-prefix>:<ip>` datagrams on a well-known UDP port once their network
//! is up. Backends without an API for guest addresses learn them here.

use crate::ProviderError;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const BROADCAST_PORT: u16 = 9967;

/// How long to wait for the listener instance itself after first boot.
pub const FIRST_BOOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long to wait for an already-running listener to re-announce.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct InstanceListener {
    bind: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
}

impl Default for InstanceListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceListener {
    pub fn new() -> Self {
        Self::with_addr(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            BROADCAST_PORT,
        )))
    }

    pub fn with_addr(bind: SocketAddr) -> Self {
        Self {
            bind,
            socket: Mutex::new(None),
        }
    }

    /// Bind the socket if it is not bound yet and return its local address.
    pub fn bind(&self) -> Result<SocketAddr, ProviderError> {
        let mut guard = self
            .socket
            .lock()
            .map_err(|e| ProviderError::backend("listener", format!("lock poisoned: {e}")))?;
        if guard.is_none() {
            let socket = UdpSocket::bind(self.bind)?;
            tracing::debug!("instance listener bound on {}", socket.local_addr()?);
            *guard = Some(socket);
        }
        match guard.as_ref() {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(ProviderError::backend("listener", "socket not bound")),
        }
    }

    /// Wait for a datagram whose payload starts with `prefix` and return the
    /// address it announces. Datagrams from other instances are ignored.
    pub fn wait_for_ip(&self, prefix: &str, timeout: Duration) -> Result<String, ProviderError> {
        self.bind()?;
        let guard = self
            .socket
            .lock()
            .map_err(|e| ProviderError::backend("listener", format!("lock poisoned: {e}")))?;
        let Some(socket) = guard.as_ref() else {
            return Err(ProviderError::backend("listener", "socket not bound"));
        };

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(prefix, timeout));
            }
            socket.set_read_timeout(Some(deadline - now))?;
            let n = match socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(timed_out(prefix, timeout));
                }
                Err(e) => return Err(e.into()),
            };
            let data = String::from_utf8_lossy(&buf[..n]);
            let data = data.trim_matches(char::from(0)).trim();
            tracing::trace!("listener received: {data}");
            if !data.starts_with(prefix) {
                continue;
            }
            if let Some(ip) = data.split(':').nth(1).filter(|ip| !ip.is_empty()) {
                tracing::debug!("instance {prefix} announced ip {ip}");
                return Ok(ip.to_owned());
            }
        }
    }
}

fn timed_out(prefix: &str, timeout: Duration) -> ProviderError {
    ProviderError::Timeout {
        what: format!("ip announcement from {prefix}"),
        after: timeout,
    }
}
