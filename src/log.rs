use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Diagnostics go to stderr so
/// stdout stays clean for `decode` output. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: bool) {
    let default = if verbose { "labsensor=debug" } else { "labsensor=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second init (tests, embedding) keeps the first subscriber
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
