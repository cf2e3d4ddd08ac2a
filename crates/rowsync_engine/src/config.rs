//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// How a local delete reaches the remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoteDeleteMode {
    /// Upsert the tombstone (`deleted_at` set); other clients pull it.
    #[default]
    Tombstone,
    /// Upsert the tombstone, then delete the remote row.
    Purge,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Tables the engine pushes and pulls.
    pub managed_tables: Vec<String>,
    /// Managed tables skipped by push.
    pub excluded_tables: Vec<String>,
    /// Rows per pull page.
    pub pull_page_size: usize,
    /// Rows merged between cooperative yields.
    pub pull_yield_every: usize,
    /// Rows per push chunk.
    pub push_chunk_size: usize,
    /// Upper bound on bind parameters in one local statement.
    pub max_bind_params: usize,
    /// Tables pushed concurrently.
    pub table_concurrency: usize,
    /// Retry behaviour of push chunks.
    pub push_retry: RetryConfig,
    /// Retry behaviour of queued remote calls.
    pub queue_retry: RetryConfig,
    /// Wait between connectivity checks while offline.
    pub offline_retry_delay: Duration,
    /// Offline checks before a queued call gives up.
    pub offline_retry_limit: u32,
    /// Remote delete behaviour.
    pub remote_delete: RemoteDeleteMode,
    /// Remote function used for bulk upserts instead of `upsert`.
    pub bulk_upsert_rpc: Option<String>,
    /// Automatic push interval.
    pub push_interval: Option<Duration>,
    /// Automatic pull interval.
    pub pull_interval: Option<Duration>,
    /// Minimum gap between non-forced full cycles.
    pub min_sync_interval: Duration,
    /// Capacity of the change-event channel.
    pub event_capacity: usize,
    /// Confirmed op keys remembered by the queue.
    pub dedup_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration managing `tables`.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            managed_tables: tables.into_iter().map(Into::into).collect(),
            excluded_tables: Vec::new(),
            pull_page_size: 1000,
            pull_yield_every: 500,
            push_chunk_size: 500,
            max_bind_params: 999,
            table_concurrency: 3,
            push_retry: RetryConfig::new(5),
            queue_retry: RetryConfig::new(3),
            offline_retry_delay: Duration::from_secs(5),
            offline_retry_limit: 3,
            remote_delete: RemoteDeleteMode::default(),
            bulk_upsert_rpc: None,
            push_interval: None,
            pull_interval: None,
            min_sync_interval: Duration::from_secs(2),
            event_capacity: 256,
            dedup_capacity: 10_000,
        }
    }

    /// Excludes tables from push.
    pub fn with_excluded_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    /// Sets how many rows are merged between yields.
    pub fn with_pull_yield_every(mut self, rows: usize) -> Self {
        self.pull_yield_every = rows.max(1);
        self
    }

    /// Sets the push chunk size.
    pub fn with_push_chunk_size(mut self, size: usize) -> Self {
        self.push_chunk_size = size.max(1);
        self
    }

    /// Sets the bind parameter limit.
    pub fn with_max_bind_params(mut self, limit: usize) -> Self {
        self.max_bind_params = limit.max(1);
        self
    }

    /// Sets the number of tables pushed concurrently.
    pub fn with_table_concurrency(mut self, tables: usize) -> Self {
        self.table_concurrency = tables.max(1);
        self
    }

    /// Sets the push retry configuration.
    pub fn with_push_retry(mut self, retry: RetryConfig) -> Self {
        self.push_retry = retry;
        self
    }

    /// Sets the queue retry configuration.
    pub fn with_queue_retry(mut self, retry: RetryConfig) -> Self {
        self.queue_retry = retry;
        self
    }

    /// Sets the offline wait and the number of offline checks.
    pub fn with_offline_retry(mut self, delay: Duration, limit: u32) -> Self {
        self.offline_retry_delay = delay;
        self.offline_retry_limit = limit;
        self
    }

    /// Sets the remote delete behaviour.
    pub fn with_remote_delete(mut self, mode: RemoteDeleteMode) -> Self {
        self.remote_delete = mode;
        self
    }

    /// Routes push upserts through a remote function.
    pub fn with_bulk_upsert_rpc(mut self, function: impl Into<String>) -> Self {
        self.bulk_upsert_rpc = Some(function.into());
        self
    }

    /// Sets the automatic push interval.
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = Some(interval);
        self
    }

    /// Sets the automatic pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    /// Sets the throttle for non-forced full cycles.
    pub fn with_min_sync_interval(mut self, interval: Duration) -> Self {
        self.min_sync_interval = interval;
        self
    }

    /// Sets the change-event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Returns the tables push walks: managed minus excluded.
    pub fn push_tables(&self) -> Vec<String> {
        self.managed_tables
            .iter()
            .filter(|table| !self.excluded_tables.contains(table))
            .cloned()
            .collect()
    }

    /// Returns true if `table` is managed.
    pub fn is_managed(&self, table: &str) -> bool {
        self.managed_tables.iter().any(|t| t == table)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
