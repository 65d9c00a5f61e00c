//! Background reconciliation of a provider's ledger.
//!
//! Listing instances is the synchronization point with a backend authority,
//! so the loop simply lists on an interval: dead VMMs and instances the
//! authority no longer knows are dropped, and volume attachments follow.

use crate::concurrency::shutdown_requested;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use unikit_provider::Provider;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Longest sleep between checks of the stop flag.
const STOP_POLL: Duration = Duration::from_millis(50);

pub struct ReconcilerHandle {
    provider: String,
    stop: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Completed reconciliation passes, successful or not.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        match &self.thread {
            Some(thread) => thread.is_finished(),
            None => true,
        }
    }

    /// Ask the loop to exit and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reconciler for {} panicked", self.provider);
            }
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `ListInstances` against `provider` every `interval` on a background
/// thread until the handle is stopped or a shutdown is requested.
pub fn spawn_reconciler(provider: Arc<dyn Provider>, interval: Duration) -> ReconcilerHandle {
    let name = provider.name().to_owned();
    let stop = Arc::new(AtomicBool::new(false));
    let passes = Arc::new(AtomicU64::new(0));

    let thread = {
        let stop = Arc::clone(&stop);
        let passes = Arc::clone(&passes);
        let name = name.clone();
        thread::spawn(move || {
            debug!("reconciler for {name} started");
            while !stopping(&stop) {
                match provider.list_instances() {
                    Ok(instances) => debug!("{name}: {} instance(s) in sync", instances.len()),
                    Err(e) => warn!("{name}: reconciliation failed: {e}"),
                }
                passes.fetch_add(1, Ordering::SeqCst);

                let next = Instant::now() + interval;
                while !stopping(&stop) {
                    let now = Instant::now();
                    if now >= next {
                        break;
                    }
                    thread::sleep((next - now).min(STOP_POLL));
                }
            }
            debug!("reconciler for {name} stopped");
        })
    };

    ReconcilerHandle {
        provider: name,
        stop,
        passes,
        thread: Some(thread),
    }
}

fn stopping(stop: &AtomicBool) -> bool {
    stop.load(Ordering::SeqCst) || shutdown_requested()
}
