use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// How many entries a remote iterator prefetches per round trip.
pub const DEFAULT_ITERATOR_FETCH: usize = 2048;

/// Flush buffered remote writes after this many pending entries.
pub const DEFAULT_FLUSH_FREQUENCY: usize = 1_000_000;

/// Configuration shared by the master and every worker of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of workers the master waits for before serving clients.
    pub num_workers: usize,
    /// Shards per table. `None` picks `2 * num_workers + 1`.
    pub num_shards: Option<usize>,
    /// Buffered remote writes that trigger an automatic flush.
    pub flush_frequency: usize,
    /// Entries fetched per remote-iterator round trip.
    pub iterator_fetch: usize,
    /// Interval between worker pings, also the scheduler's wait quantum.
    pub ping_interval_ms: u64,
    /// Ping staleness after which the master declares a worker dead.
    pub ping_timeout_ms: u64,
    /// RPC handler threads per worker.
    pub handler_threads: usize,
    /// How many times a failed kernel is retried on a different worker.
    pub kernel_retry_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_shards: None,
            flush_frequency: DEFAULT_FLUSH_FREQUENCY,
            iterator_fetch: DEFAULT_ITERATOR_FETCH,
            ping_interval_ms: 500,
            ping_timeout_ms: 10_000,
            handler_threads: 4,
            kernel_retry_limit: 1,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(CoreError::Config("num_workers must be > 0".to_string()));
        }
        if matches!(self.num_shards, Some(0)) {
            return Err(CoreError::Config("num_shards must be > 0".to_string()));
        }
        if self.flush_frequency == 0 {
            return Err(CoreError::Config("flush_frequency must be > 0".to_string()));
        }
        if self.iterator_fetch == 0 {
            return Err(CoreError::Config("iterator_fetch must be > 0".to_string()));
        }
        if self.handler_threads < 2 {
            // One handler must stay free to apply inbound batches while
            // another blocks on a tainted read.
            return Err(CoreError::Config("handler_threads must be >= 2".to_string()));
        }
        if self.ping_timeout_ms < self.ping_interval_ms {
            return Err(CoreError::Config(
                "ping_timeout_ms must be >= ping_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Shard count for a new table given the registered worker count.
    pub fn shards_for(&self, num_workers: usize) -> usize {
        self.num_shards.unwrap_or(num_workers * 2 + 1)
    }
}
