use crate::config::Environment;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Format layer for `environment`: JSON lines in production, pretty
/// multi-line output in development.
pub(crate) fn fmt_layer<S>(environment: Environment) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    match environment {
        Environment::Production => tracing_subscriber::fmt::layer()
            .json()
            .with_level(true)
            .with_current_span(false)
            .boxed(),
        Environment::Development => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(true)
            .boxed(),
    }
}

/// Install the global subscriber with `extra` (e.g. an OpenTelemetry layer)
/// between the filter and the formatter.
pub(crate) fn install<L>(environment: Environment, extra: L) -> anyhow::Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    tracing_subscriber::registry()
        .with(extra)
        .with(env_filter())
        .with(fmt_layer(environment))
        .try_init()?;
    Ok(())
}

/// Initialize logging without telemetry export.
///
/// Uses `RUST_LOG` for filtering (defaults to [`DEFAULT_FILTER`]). Fails if a
/// global subscriber is already installed.
pub fn setup_logging(environment: Environment) -> anyhow::Result<()> {
    install(environment, tracing_subscriber::layer::Identity::new())
}
