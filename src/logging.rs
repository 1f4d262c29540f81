//! Logging setup for the `ringread` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ringread::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
///
/// # Errors
///
/// Returns an error if the configured level is not a valid filter directive.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    if config.json {
        let layer = tracing_subscriber::fmt::layer().json().with_target(true).with_current_span(true);
        tracing_subscriber::registry().with(env_filter).with(layer).try_init()?;
    } else {
        let layer = tracing_subscriber::fmt::layer().compact().with_target(false);
        tracing_subscriber::registry().with(env_filter).with(layer).try_init()?;
    }

    Ok(())
}
