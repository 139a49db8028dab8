//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration.
///
/// `level` is the log level requested on the command line (if any); the
/// `RUST_LOG` environment variable takes precedence over it.
pub fn initialize_tracing(level: Option<&str>) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(level.unwrap_or("warn")),
    };
    // Log to stderr by default. Setup is idempotent; a second call (e.g.
    // when the CLI entrypoint is driven in-process by tests) keeps the
    // first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .try_init();
}
