// Logging Setup
// Console tracing subscriber for hosts that do not install their own.
// Filter priority: explicit filter > DBCONN_LOG > RUST_LOG > default.

use tracing_subscriber::EnvFilter;

/// Environment variable checked before RUST_LOG
pub const LOG_ENV_VAR: &str = "DBCONN_LOG";

/// Install a console subscriber. Returns false when the host already
/// installed a global subscriber, which is left untouched.
pub fn init_logging(filter: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok()
}

fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter for the build type; driver internals are kept quiet
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,dbconn_core=debug,mongodb=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,dbconn_core=info,mongodb=warn"
    }
}
