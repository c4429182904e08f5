//! Tracing subscriber setup.

use replica_sync_config::LoggingConfig;
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceLock<bool> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Safe to call more than once; only the first call has an effect. Returns
/// whether this call (or an earlier one) installed the subscriber.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.filter))
            .unwrap_or_else(|_| EnvFilter::new("replica_sync=info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        let config = LoggingConfig::default();
        let first = init_tracing(&config);
        assert_eq!(init_tracing(&config), first);
    }
}
