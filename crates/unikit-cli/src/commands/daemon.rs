use super::{App, EXIT_SUCCESS};
use std::thread;
use std::time::Duration;
use tracing::info;
use unikit_core::{shutdown_requested, spawn_reconciler, DaemonLock};

/// Hold the home's daemon lock and reconcile every provider until Ctrl-C.
pub fn run(app: &App, interval_ms: u64) -> Result<u8, String> {
    if app.registry().is_empty() {
        return Err("no providers are configured".to_owned());
    }
    let home = app
        .config()
        .home_dir()
        .map_err(|e| format!("config error: {e}"))?;
    std::fs::create_dir_all(&home)
        .map_err(|e| format!("failed to create {}: {e}", home.display()))?;
    let lock = DaemonLock::try_acquire(&home.join("daemon.lock")).map_err(|e| e.to_string())?;

    let interval = Duration::from_millis(interval_ms.max(1));
    let handles: Vec<_> = app
        .scope()?
        .into_iter()
        .map(|provider| spawn_reconciler(provider, interval))
        .collect();
    info!(
        lock = %lock.path().display(),
        providers = handles.len(),
        "daemon running"
    );
    if !app.json {
        println!(
            "reconciling {} provider(s) every {interval_ms} ms; Ctrl-C to stop",
            handles.len()
        );
    }

    while !shutdown_requested() && handles.iter().any(|h| !h.is_finished()) {
        thread::sleep(Duration::from_millis(100));
    }
    for handle in handles {
        info!(passes = handle.passes(), "stopping reconciler for {}", handle.provider());
        handle.stop();
    }
    Ok(EXIT_SUCCESS)
}
