//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered by `RUST_LOG` or, failing that, `LOG_LEVEL`.

use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

/// Initialize tracing/logging for the process.
///
/// Returns the root `service` span; instrument the process body with it so
/// every record carries the service name. Safe to call multiple times
/// (subsequent subscriber installs are no-ops).
pub fn init(service: &'static str) -> ::tracing::Span {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init();

    ::tracing::info_span!("service", name = service)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LEVEL.to_string());
        EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    })
}
