use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build the filter: a non-empty `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(level: &str) -> Result<EnvFilter, String> {
    match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => Ok(EnvFilter::from_default_env()),
        _ => EnvFilter::try_new(level).map_err(|e| format!("invalid log level '{level}': {e}")),
    }
}

/// Install the global subscriber. Logs go to stderr; stdout stays free for
/// anything a launcher might want to parse.
pub fn init_tracing(level: &str) -> Result<(), String> {
    let filter = env_filter(level)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| format!("tracing already initialized: {e}"))
}
