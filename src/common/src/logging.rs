//! Log output setup.
//!
//! Library code only emits `tracing` events; binaries and tests decide where
//! they go by installing a subscriber here or with
//! `tracing::subscriber::with_default`.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over the
/// configured level. Calling this more than once is harmless.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Route log output through the test harness so it is captured per test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialisation_is_harmless() {
        init_test_logging();
        init_logging(&LoggingConfig {
            level: "debug".to_string(),
        });
        init_logging(&LoggingConfig::default());
        tracing::info!("logging initialised");
    }
}
