use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Initialise the global tracing subscriber.
///
/// The log level comes from `RUST_LOG` when set, otherwise `INFO`. This
/// function is idempotent — calls after the first are no-ops.
pub fn init_tracing() {
    init_tracing_with(None);
}

/// Like [`init_tracing`] but with an explicit level directive taking
/// precedence over `RUST_LOG`. The worker uses this to honor the
/// `--trace` flag derived from the `InternalTraceLevel` package setting.
pub fn init_tracing_with(level: Option<&str>) {
    TRACING_INIT.call_once(|| {
        let filter = match level {
            Some(level) => tracing_subscriber::EnvFilter::new(level),
            None => tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        };
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init();
    });
}
