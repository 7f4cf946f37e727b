//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// How long a writer waits for a document or store lock before the
    /// operation fails with `Busy`.
    pub lock_timeout: Duration,

    /// Maximum number of ancestor revision ids kept per document.
    pub max_history_depth: usize,

    /// Number of change events retained for polling.
    pub change_feed_history: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            max_history_depth: 20,
            change_feed_history: 1000,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the revision history depth. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_history_depth(mut self, depth: usize) -> Self {
        self.max_history_depth = depth.max(1);
        self
    }

    /// Sets the change feed history size.
    #[must_use]
    pub const fn with_change_feed_history(mut self, events: usize) -> Self {
        self.change_feed_history = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.max_history_depth, 20);
    }

    #[test]
    fn builder_pattern() {
        let config = DatabaseConfig::new()
            .with_lock_timeout(Duration::from_millis(50))
            .with_max_history_depth(0)
            .with_change_feed_history(10);

        assert_eq!(config.lock_timeout, Duration::from_millis(50));
        assert_eq!(config.max_history_depth, 1);
        assert_eq!(config.change_feed_history, 10);
    }
}
