use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber from server config. A `RUST_LOG` directive
/// wins over the configured level so an operator can raise verbosity for a
/// single module (say, one listener) without editing the config file.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        // Flattened fields keep agent_id/task_id at the top level for log
        // pipelines that index on them.
        LogFormat::Json => registry.with(fmt::layer().json().flatten_event(true)).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(false)).init(),
    }
}
