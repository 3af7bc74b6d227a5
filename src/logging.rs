//! Tracing subscriber setup for embedding applications.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const ENV_FILTER: &str = "REVSTAT_LOG";

/// Installs a global `tracing` subscriber filtered by `REVSTAT_LOG`.
///
/// Logging is off unless the variable is set. Calling this twice is
/// harmless; the second installation attempt is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_env(ENV_FILTER).unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
