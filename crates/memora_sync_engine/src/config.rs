//! Configuration for the sync engine.

use memora_sync_protocol::{CLIENT_VERSION, DEFAULT_CONCURRENT_WINDOW_SECS};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Observed or reported link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// Low latency.
    #[default]
    Good,
    /// Usable but slow.
    Fair,
    /// High latency or lossy.
    Poor,
}

impl NetworkQuality {
    /// Classifies a measured round-trip latency.
    pub fn from_latency(latency: Duration) -> Self {
        if latency < Duration::from_millis(300) {
            NetworkQuality::Good
        } else if latency < Duration::from_millis(1000) {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

/// The user and device a sync session acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    /// Authenticated user.
    pub user_id: String,
    /// Stable device identifier.
    pub device_id: String,
}

impl UserContext {
    /// Creates a user context.
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// User and device.
    pub user: UserContext,
    /// Server URL.
    pub server_url: String,
    /// Client version sent with every request.
    pub client_version: String,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Window within which two edits count as concurrent.
    pub concurrent_window: chrono::Duration,
    /// Operations per cycle on a good link.
    pub batch_size_good: usize,
    /// Operations per cycle on a fair link.
    pub batch_size_fair: usize,
    /// Operations per cycle on a poor link.
    pub batch_size_poor: usize,
    /// Periodic sync interval on a good link.
    pub interval_good: Duration,
    /// Periodic sync interval on a fair link.
    pub interval_fair: Duration,
    /// Periodic sync interval on a poor link.
    pub interval_poor: Duration,
    /// Quiet period after a visibility change before syncing.
    pub visibility_debounce: Duration,
    /// Number of recent errors kept in metrics.
    pub max_error_history: usize,
    /// Request timeout.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(user: UserContext, server_url: impl Into<String>) -> Self {
        Self {
            user,
            server_url: server_url.into(),
            client_version: CLIENT_VERSION.to_string(),
            retry: RetryConfig::default(),
            concurrent_window: chrono::Duration::seconds(DEFAULT_CONCURRENT_WINDOW_SECS),
            batch_size_good: 10,
            batch_size_fair: 5,
            batch_size_poor: 2,
            interval_good: Duration::from_secs(30),
            interval_fair: Duration::from_secs(60),
            interval_poor: Duration::from_secs(120),
            visibility_debounce: Duration::from_secs(1),
            max_error_history: 20,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the concurrent-edit window.
    pub fn with_concurrent_window(mut self, window: chrono::Duration) -> Self {
        self.concurrent_window = window;
        self
    }

    /// Sets the batch sizes for good, fair and poor links.
    pub fn with_batch_sizes(mut self, good: usize, fair: usize, poor: usize) -> Self {
        self.batch_size_good = good;
        self.batch_size_fair = fair;
        self.batch_size_poor = poor;
        self
    }

    /// Sets the periodic sync intervals for good, fair and poor links.
    pub fn with_intervals(mut self, good: Duration, fair: Duration, poor: Duration) -> Self {
        self.interval_good = good;
        self.interval_fair = fair;
        self.interval_poor = poor;
        self
    }

    /// Sets the visibility debounce.
    pub fn with_visibility_debounce(mut self, debounce: Duration) -> Self {
        self.visibility_debounce = debounce;
        self
    }

    /// Sets the number of recent errors kept in metrics.
    pub fn with_max_error_history(mut self, max: usize) -> Self {
        self.max_error_history = max;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the batch size for `quality`.
    pub fn batch_size(&self, quality: NetworkQuality) -> usize {
        match quality {
            NetworkQuality::Good => self.batch_size_good,
            NetworkQuality::Fair => self.batch_size_fair,
            NetworkQuality::Poor => self.batch_size_poor,
        }
    }

    /// Returns the periodic sync interval for `quality`.
    pub fn sync_interval(&self, quality: NetworkQuality) -> Duration {
        match quality {
            NetworkQuality::Good => self.interval_good,
            NetworkQuality::Fair => self.interval_fair,
            NetworkQuality::Poor => self.interval_poor,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which an operation is parked.
    pub max_attempts: u32,
    /// Delay unit doubled per attempt.
    pub base_delay: Duration,
    /// Maximum delay before jitter.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: Duration::from_millis(1000),
            add_jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// `min(base · 2^retry_count, max)`, without jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff for `retry_count` plus random jitter.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let delay = self.backoff(retry_count);
        if !self.add_jitter || self.max_jitter.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
