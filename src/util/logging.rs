use tracing_subscriber::{fmt, EnvFilter};

/// Initializes tracing based on `RUST_LOG`, defaulting to info level for
/// the crate and warn for everything else.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,flowlens=info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}
