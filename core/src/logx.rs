use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. `RUST_LOG` wins over `default_level`.
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_level: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().with_current_span(false).try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
