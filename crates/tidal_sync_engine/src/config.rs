//! Configuration for the sync engine.

use std::time::Duration;

/// Cache size value that turns LRU collection off.
pub const COLLECTION_DISABLED: i64 = -1;

/// Configuration for a sync client.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Connectivity tracking.
    pub online_state: OnlineStateConfig,
    /// Cache reclamation.
    pub lru: LruParams,
    /// Reconnect backoff used by transports.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connectivity tracking configuration.
    pub fn with_online_state(mut self, online_state: OnlineStateConfig) -> Self {
        self.online_state = online_state;
        self
    }

    /// Sets the cache reclamation parameters.
    pub fn with_lru(mut self, lru: LruParams) -> Self {
        self.lru = lru;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for the online state tracker.
#[derive(Debug, Clone)]
pub struct OnlineStateConfig {
    /// Consecutive stream failures before the client is reported offline.
    pub max_watch_stream_failures: u32,
    /// How long a connection attempt may go without a message before the
    /// client is reported offline. `None` disables the timeout.
    pub online_state_timeout: Option<Duration>,
}

impl OnlineStateConfig {
    /// Sets the failure threshold.
    pub fn with_max_watch_stream_failures(mut self, failures: u32) -> Self {
        self.max_watch_stream_failures = failures.max(1);
        self
    }

    /// Sets the connection attempt timeout.
    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = Some(timeout);
        self
    }

    /// Disables the connection attempt timeout.
    pub fn without_online_state_timeout(mut self) -> Self {
        self.online_state_timeout = None;
        self
    }
}

impl Default for OnlineStateConfig {
    fn default() -> Self {
        Self {
            max_watch_stream_failures: 2,
            online_state_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Parameters for least-recently-used cache collection.
#[derive(Debug, Clone)]
pub struct LruParams {
    /// Cache size in bytes below which collection is skipped, or
    /// [`COLLECTION_DISABLED`].
    pub cache_size_collection_threshold: i64,
    /// Percentage of targets (by sequence number) to collect per run.
    pub percentile_to_collect: u32,
    /// Upper bound on sequence numbers collected per run.
    pub maximum_sequence_numbers_to_collect: usize,
    /// Delay before the first collection after startup.
    pub initial_delay: Duration,
    /// Delay between the end of one collection and the next.
    pub regular_delay: Duration,
}

impl LruParams {
    /// Creates parameters with the given size threshold.
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            ..Self::default()
        }
    }

    /// Creates parameters that never collect.
    pub fn disabled() -> Self {
        Self::with_cache_size(COLLECTION_DISABLED)
    }

    /// Returns true if collection is turned off.
    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == COLLECTION_DISABLED
    }

    /// Sets the percentile collected per run.
    pub fn with_percentile(mut self, percentile: u32) -> Self {
        self.percentile_to_collect = percentile.min(100);
        self
    }

    /// Sets the cap on sequence numbers collected per run.
    pub fn with_maximum_sequence_numbers(mut self, maximum: usize) -> Self {
        self.maximum_sequence_numbers_to_collect = maximum;
        self
    }

    /// Sets the first and subsequent collection delays.
    pub fn with_delays(mut self, initial: Duration, regular: Duration) -> Self {
        self.initial_delay = initial;
        self.regular_delay = regular;
        self
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: 40 * 1024 * 1024,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
            initial_delay: Duration::from_secs(60),
            regular_delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Maximum delay between reconnects.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Creates a configuration that reconnects immediately.
    pub fn no_backoff() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// The first attempt is never delayed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            add_jitter: true,
        }
    }
}

/// Cheap pseudo-random value in `[0, 1)` taken from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
