//! Logging setup.

use director_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// The filter used when `RUST_LOG` is unset.
pub fn default_filter(logging: &LoggingConfig) -> String {
    format!("{},directord=debug", logging.level)
}

/// Install the global subscriber. `RUST_LOG` wins over the config level.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(logging))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_follows_config_level() {
        let logging = LoggingConfig {
            level: "warn".into(),
            json: false,
        };
        assert_eq!(default_filter(&logging), "warn,directord=debug");
        assert!(EnvFilter::try_new(default_filter(&logging)).is_ok());
    }
}
