pub mod config;
pub mod logging;
pub mod retry;
pub mod telemetry;
pub mod wait;

pub use config::{Environment, env_millis, env_optional, env_parse, env_string};
pub use logging::setup_logging;
pub use retry::{Backoff, retry_with_backoff};
pub use telemetry::TelemetryGuard;
pub use wait::{poll_until, wait_for_resource};
