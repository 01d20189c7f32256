//! Logging setup.
//!
//! A thin wrapper over `tracing-subscriber` so binaries and tests configure
//! logging the same way. Levels are plain [`tracing::Level`]s; there is no
//! shim enum to convert through.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::Level;

/// Configuration for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum level to emit.
    pub level: Level,
    /// Whether lines carry the module path that emitted them.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// A config at the default info level.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Toggles module paths on log lines.
    #[must_use]
    pub fn with_target(mut self, include_target: bool) -> Self {
        self.include_target = include_target;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::new(self.level.to_string())
    }
}

/// Installs the global subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already installed; use [`try_init`]
/// where that is expected.
pub fn init(config: &LogConfig) {
    let subscriber = tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt::layer().with_target(config.include_target));
    tracing::subscriber::set_global_default(subscriber)
        .expect("a global subscriber is already installed");
}

/// Installs the global subscriber unless one is already installed.
///
/// Tests call this freely; only the first call wins.
pub fn try_init(config: &LogConfig) {
    let subscriber = tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt::layer().with_target(config.include_target));
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.include_target);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = LogConfig::new()
            .with_level(Level::TRACE)
            .with_target(false);
        assert_eq!(config.level, Level::TRACE);
        assert!(!config.include_target);
    }

    #[test]
    fn repeated_try_init_is_tolerated() {
        try_init(&LogConfig::default());
        try_init(&LogConfig::new().with_level(Level::ERROR));
    }
}
