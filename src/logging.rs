use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Diagnostics go to stderr because
/// stdout carries protocol lines in serve mode. `RUST_LOG` overrides the
/// default filter.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("daftar=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
