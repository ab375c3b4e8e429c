//! Tracing bootstrap helpers.

/// Initialize logging for development: human-readable, protocol tracing on.
pub fn init_dev_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mpt_transport=debug,mpt_core=debug")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

/// Initialize logging for production: JSON lines, lifecycle events only.
pub fn init_prod_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .json()
        .init();
}

/// Initialize logging with a custom filter string.
pub fn init_logging_with_filter(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(true)
        .init();
}
