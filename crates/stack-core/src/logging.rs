//! Logging setup for binaries and tests.
use tracing::Level;

/// Overrides the level passed to [`init`], e.g. `STACK_LOG=debug`.
pub const LOG_ENV: &str = "STACK_LOG";

/// Installs a global fmt subscriber. Returns false if one was already set.
pub fn init(default_level: Level) -> bool {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(default_level);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Quiet workspaces only log warnings and errors.
pub fn level_for(quiet: bool) -> Level {
    if quiet {
        Level::WARN
    } else {
        Level::INFO
    }
}
