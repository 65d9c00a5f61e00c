use crate::ProviderError;
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_INTERVAL: Duration = Duration::from_secs(10);
const CEILING: Duration = Duration::from_secs(5 * 60);

/// Bounded exponential backoff for polling a backend until a resource
/// reaches a target state.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max_interval: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: INITIAL_INTERVAL,
            max_interval: MAX_INTERVAL,
            ceiling: CEILING,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    #[must_use]
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    #[must_use]
    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Call `poll` until it yields a value, an error, or the ceiling passes.
    ///
    /// The first poll happens immediately. Sleeps never run past the
    /// ceiling, so the total wait is bounded by it.
    pub fn wait<T, F>(&self, what: &str, mut poll: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Result<Option<T>, ProviderError>,
    {
        let start = Instant::now();
        let deadline = start + self.ceiling;
        let mut interval = self.initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(value) = poll()? {
                tracing::debug!("{what} ready after {attempts} attempt(s)");
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("{what} not ready after {attempts} attempt(s)");
                return Err(ProviderError::Timeout {
                    what: what.to_owned(),
                    after: self.ceiling,
                });
            }
            thread::sleep(interval.min(deadline - now));
            interval = (interval * 2).min(self.max_interval);
        }
    }
}
