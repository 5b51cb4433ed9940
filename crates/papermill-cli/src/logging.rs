use tracing_subscriber::EnvFilter;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over `log_level` when set.
pub(crate) fn init(log_level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
