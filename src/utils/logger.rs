use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging for the application
pub fn init() {
    // Log level from RUST_LOG, warnings only otherwise so the shell stays readable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true).with_writer(std::io::stderr))
        .init();

    tracing::debug!("SSH session manager started");
}

/// Initialize logging with custom level
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::new(format!("{},ssh_session_manager={}", level, level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true).with_writer(std::io::stderr))
        .init();

    tracing::info!("Logging initialized with level: {}", level);
}
