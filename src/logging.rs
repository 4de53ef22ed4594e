//! Tracing setup shared by binaries and tests.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global tracing subscriber, reading the filter from
/// `NIMBUS_LOG` (falling back to `info`). Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("NIMBUS_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
