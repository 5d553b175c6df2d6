//! Server configuration.

use chrono::Duration;
use memora_scheduler::PartialSettings;
use memora_sync_protocol::DEFAULT_CONCURRENT_WINDOW_SECS;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Two writes closer than this count as concurrent.
    pub concurrent_window: Duration,
    /// Maximum number of deltas in one `POST /stats`.
    pub max_stats_batch: usize,
    /// Number of operation responses remembered for replay.
    pub replay_cache_size: usize,
    /// Settings used when a request carries none.
    pub default_settings: PartialSettings,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            concurrent_window: Duration::seconds(DEFAULT_CONCURRENT_WINDOW_SECS),
            max_stats_batch: 100,
            replay_cache_size: 10_000,
            default_settings: PartialSettings::default(),
        }
    }

    /// Sets the concurrent window.
    pub fn with_concurrent_window(mut self, window: Duration) -> Self {
        self.concurrent_window = window;
        self
    }

    /// Sets the maximum stats batch size.
    pub fn with_max_stats_batch(mut self, max: usize) -> Self {
        self.max_stats_batch = max;
        self
    }

    /// Sets how many responses are kept for replay.
    pub fn with_replay_cache_size(mut self, size: usize) -> Self {
        self.replay_cache_size = size;
        self
    }

    /// Sets the fallback scheduler settings.
    pub fn with_default_settings(mut self, settings: PartialSettings) -> Self {
        self.default_settings = settings;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.concurrent_window, Duration::seconds(30));
        assert_eq!(config.max_stats_batch, 100);
        assert_eq!(config.replay_cache_size, 10_000);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_concurrent_window(Duration::seconds(5))
            .with_max_stats_batch(10)
            .with_replay_cache_size(2);

        assert_eq!(config.concurrent_window, Duration::seconds(5));
        assert_eq!(config.max_stats_batch, 10);
        assert_eq!(config.replay_cache_size, 2);
    }
}
