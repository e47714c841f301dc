use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set GSTREAM_LOG=debug (or trace, info, warn, error) for verbosity control.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("GSTREAM_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
