/*!
 * Pipeline Configuration
 * One immutable configuration value, validated before use, swapped atomically
 *
 * Workers hold a handle to a ConfigCell and load a snapshot each tick, so a
 * reconfiguration is a single atomic pointer swap with no torn-read states.
 */

use crate::core::errors::ConfigError;
use crate::core::limits::*;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Behavior of a staging buffer when full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Advance the floor, overwrite the oldest unread slot, count the drop
    DropOldest,
    /// Reject the incoming write, buffer unchanged
    DropNewest,
    /// Producer waits up to `block_timeout`, then behaves as `drop_newest`
    Block,
}

/// Staging buffer parameters (structural: fixed at startup)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Slot count per shard; must be a nonzero power of two
    pub capacity: usize,
    pub policy: OverflowPolicy,
    /// Producer wait budget under the `block` policy
    pub block_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            policy: OverflowPolicy::DropOldest,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

/// Ingestion parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Payloads above this size are replaced by a truncation marker
    pub max_payload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Writer pool parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    pub count: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_WRITER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Correlation engine parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Unmatched pending messages older than this are evicted as orphans
    pub pending_ttl: Duration,
    /// Correlation metadata and links older than this are swept
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            retention: DEFAULT_CORRELATION_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Store parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub max_records: usize,
    /// Age past the newest stored record after which records are pruned
    pub retention: Duration,
    pub prune_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            retention: DEFAULT_STORE_RETENTION,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

/// Complete pipeline configuration
///
/// `shard_count` and `buffer` are structural (fixed for the pipeline's
/// lifetime); everything else is a tunable that takes effect on the workers'
/// next tick after an atomic swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub shard_count: usize,
    pub buffer: BufferConfig,
    pub ingest: IngestConfig,
    pub writers: WriterConfig,
    pub correlation: CorrelationConfig,
    pub store: StoreConfig,
}

impl PipelineConfig {
    /// Validate every parameter; rejected configurations never take effect
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 || !self.buffer.capacity.is_power_of_two() {
            return Err(ConfigError::CapacityNotPowerOfTwo(self.buffer.capacity));
        }
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(ConfigError::ShardCountNotPowerOfTwo(self.shard_count));
        }
        if self.writers.count == 0 {
            return Err(ConfigError::NoWriters);
        }
        if self.writers.batch_size == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        for (name, value) in [
            ("writers.poll_interval", self.writers.poll_interval),
            ("writers.backoff_initial", self.writers.backoff_initial),
            ("writers.backoff_max", self.writers.backoff_max),
            ("correlation.pending_ttl", self.correlation.pending_ttl),
            ("correlation.retention", self.correlation.retention),
            ("correlation.sweep_interval", self.correlation.sweep_interval),
            ("store.retention", self.store.retention),
            ("store.prune_interval", self.store.prune_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name.to_string()));
            }
        }
        if self.store.max_records == 0 {
            return Err(ConfigError::EmptyStore);
        }
        if self.ingest.max_payload_bytes == 0 {
            return Err(ConfigError::ZeroPayload);
        }
        Ok(())
    }

    /// Reject changes to parameters that cannot be applied to a live pipeline
    pub fn check_structural_match(&self, current: &PipelineConfig) -> Result<(), ConfigError> {
        if self.shard_count != current.shard_count {
            return Err(ConfigError::StructuralChange("shard_count".to_string()));
        }
        if self.buffer != current.buffer {
            return Err(ConfigError::StructuralChange("buffer".to_string()));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            buffer: BufferConfig::default(),
            ingest: IngestConfig::default(),
            writers: WriterConfig::default(),
            correlation: CorrelationConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// RCU-style configuration holder
///
/// Reads are an atomic pointer load; a swap publishes a whole new
/// configuration at once. Readers that loaded the old snapshot finish their
/// tick with it and pick up the new one on the next load.
pub struct ConfigCell {
    inner: ArcSwap<PipelineConfig>,
}

impl ConfigCell {
    #[inline]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Load the current snapshot (lock-free)
    #[inline]
    pub fn load(&self) -> Arc<PipelineConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the configuration, returning the old snapshot
    #[inline]
    pub fn swap(&self, config: PipelineConfig) -> Arc<PipelineConfig> {
        self.inner.swap(Arc::new(config))
    }
}
