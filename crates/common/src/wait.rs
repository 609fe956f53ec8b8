use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Keep calling `connect` until it succeeds, sleeping `poll_interval`
/// between attempts. Returns `None` if `shutdown` is raised first.
pub fn wait_for_resource<F, T, E>(
    mut connect: F,
    poll_interval: Duration,
    resource_name: &str,
    shutdown: &AtomicBool,
) -> Option<T>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut logged = false;
    while !shutdown.load(Ordering::Relaxed) {
        match connect() {
            Ok(resource) => {
                tracing::info!(resource = resource_name, "Connected");
                return Some(resource);
            }
            Err(e) => {
                if !logged {
                    tracing::info!(resource = resource_name, reason = %e, "Waiting for resource");
                    logged = true;
                } else {
                    tracing::debug!(resource = resource_name, reason = %e, "Still waiting");
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
    None
}

/// Poll `f` until it yields a value, fails, or `timeout` elapses.
pub fn poll_until<F, T, E>(mut f: F, timeout: Duration, poll_interval: Duration) -> Result<Option<T>, E>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f()? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}
