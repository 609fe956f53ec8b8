mod config;
mod registry;
mod service;

use anyhow::Context;
use common::{TelemetryGuard, setup_logging};
use config::ChipsetConfig;
use service::ChipsetService;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

fn main() -> anyhow::Result<()> {
    let config = ChipsetConfig::from_env()?;

    // OTLP exporters need a live Tokio runtime for as long as the guard lives
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard =
            rt.block_on(async { TelemetryGuard::init("chipset", endpoint, config.environment) })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(config.environment)?;
        (None, None)
    };

    tracing::info!(?config, "Chipset starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    let Some(service) = ChipsetService::connect(config, &shutdown)? else {
        tracing::info!("Shutdown requested before the channel appeared");
        return Ok(());
    };
    service.run(&shutdown)
}
