//! Logging initialization. Events are emitted through `tracing`; messages
//! from libraries still using the `log` facade are captured and forwarded by
//! the tracing-log bridge.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global subscriber. The filter argument takes RUST_LOG
/// style directives and is overridden by the RUST_LOG environment variable;
/// with neither present the engine logs at info level.
///
/// Safe to call more than once, only the first call takes effect.
pub fn init(filter: Option<&str>) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| match filter {
                Some(directives) => EnvFilter::try_new(directives),
                None => EnvFilter::try_new("info"),
            })
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            // somebody else (a test harness typically) installed one already
            return;
        }

        tracing_log::LogTracer::init().ok();
    });
}
