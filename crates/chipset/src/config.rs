use common::{Backoff, Environment, env_millis, env_optional, env_parse, env_string};
use std::time::Duration;
use visorbus::paths;

#[derive(Debug, Clone)]
pub struct ChipsetConfig {
    pub environment: Environment,
    pub controlvm_path: String,
    pub request_doorbell: String,
    pub response_doorbell: String,
    /// Wait between polls when the doorbell is off or silent.
    pub poll_interval: Duration,
    /// Requests drained per iteration before responses are flushed.
    pub max_batch: usize,
    /// Announced bus count for the local init that precedes crash replay.
    pub replay_bus_count: u32,
    pub use_doorbell: bool,
    pub doorbell_backoff: Backoff,
    pub otel_endpoint: Option<String>,
}

impl ChipsetConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let max_batch = env_parse("CHIPSET_MAX_BATCH", 32usize);
        if max_batch == 0 {
            anyhow::bail!("CHIPSET_MAX_BATCH must be at least 1");
        }

        Ok(Self {
            environment: Environment::from_env(),
            controlvm_path: env_string("CONTROLVM_CHANNEL_PATH", paths::CONTROLVM_CHANNEL_PATH),
            request_doorbell: env_string(
                "CONTROLVM_REQUEST_SEMAPHORE",
                paths::SEMAPHORE_CONTROLVM_REQUEST,
            ),
            response_doorbell: env_string(
                "CONTROLVM_RESPONSE_SEMAPHORE",
                paths::SEMAPHORE_CONTROLVM_RESPONSE,
            ),
            poll_interval: env_millis("POLL_INTERVAL_MS", 100),
            max_batch,
            replay_bus_count: env_parse("CHIPSET_REPLAY_BUS_COUNT", 23),
            use_doorbell: env_parse("CHIPSET_USE_DOORBELL", cfg!(feature = "semaphores")),
            doorbell_backoff: Backoff {
                max_attempts: env_parse("DOORBELL_OPEN_ATTEMPTS", 5),
                base: env_millis("DOORBELL_OPEN_BACKOFF_MS", 100),
                max_delay: Duration::from_secs(2),
            },
            otel_endpoint: env_optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 5] = [
        "CONTROLVM_CHANNEL_PATH",
        "POLL_INTERVAL_MS",
        "CHIPSET_MAX_BATCH",
        "CHIPSET_USE_DOORBELL",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
    ];

    fn clear() {
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults_point_at_shared_paths() {
        clear();
        let config = ChipsetConfig::from_env().unwrap();
        assert_eq!(config.controlvm_path, paths::CONTROLVM_CHANNEL_PATH);
        assert_eq!(config.request_doorbell, paths::SEMAPHORE_CONTROLVM_REQUEST);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.max_batch, 32);
        assert_eq!(config.replay_bus_count, 23);
        assert!(config.otel_endpoint.is_none());
    }

    #[test]
    #[serial]
    fn test_overrides_are_read() {
        clear();
        unsafe {
            std::env::set_var("CONTROLVM_CHANNEL_PATH", "/tmp/cvm");
            std::env::set_var("POLL_INTERVAL_MS", "5");
            std::env::set_var("CHIPSET_USE_DOORBELL", "false");
        }
        let config = ChipsetConfig::from_env().unwrap();
        assert_eq!(config.controlvm_path, "/tmp/cvm");
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(!config.use_doorbell);
        clear();
    }

    #[test]
    #[serial]
    fn test_zero_batch_is_rejected() {
        clear();
        unsafe { std::env::set_var("CHIPSET_MAX_BATCH", "0") };
        assert!(ChipsetConfig::from_env().is_err());
        clear();
    }
}
