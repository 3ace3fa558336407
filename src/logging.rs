//! Ambient logging facade. Replaces the source's GUI log-interception
//! singleton (`logging_config.py`) with a single subscriber installed once
//! at process start; library code only ever emits `tracing` events.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber. Safe to call more than once —
/// only the first call takes effect. The CLI binary calls this before doing
/// anything else; library code must never call it itself.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
