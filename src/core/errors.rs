/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a write was turned away at the staging buffer
///
/// Returned synchronously to the producer; never raised across the hot path.
/// The caller decides whether to drop, degrade sampling, or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The buffer is full and the overflow policy refuses new writes
    BufferFull,
    /// The `block` policy waited out its timeout without a free slot
    Timeout,
    /// The pipeline is shutting down and no longer accepts events
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferFull => write!(f, "buffer full"),
            Self::Timeout => write!(f, "block timeout elapsed"),
            Self::ShuttingDown => write!(f, "pipeline shutting down"),
        }
    }
}

/// Staging buffer construction errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum BufferError {
    #[error("Buffer capacity {0} is not a nonzero power of two")]
    #[diagnostic(
        code(buffer::invalid_capacity),
        help("Slot indexing uses position & (capacity - 1); pick 2^n slots.")
    )]
    InvalidCapacity(usize),

    #[error("Cursor {0} is not registered with this buffer")]
    #[diagnostic(
        code(buffer::unknown_cursor),
        help("Register a cursor before reading; cursors do not survive deregistration.")
    )]
    UnknownCursor(u32),
}

/// Configuration errors, fatal only at startup or reconfiguration
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("Buffer capacity {0} must be a nonzero power of two")]
    #[diagnostic(
        code(config::buffer_capacity),
        help("Slot indexing uses position & (capacity - 1); pick 2^n slots.")
    )]
    CapacityNotPowerOfTwo(usize),

    #[error("Shard count {0} must be a nonzero power of two")]
    #[diagnostic(
        code(config::shard_count),
        help("Process-to-shard routing is a bitmask over the hash; pick 2^n shards.")
    )]
    ShardCountNotPowerOfTwo(usize),

    #[error("Writer count must be at least 1")]
    #[diagnostic(
        code(config::no_writers),
        help("A pipeline without Writers stages events forever; configure one or more.")
    )]
    NoWriters,

    #[error("Batch size must be at least 1")]
    #[diagnostic(
        code(config::empty_batch),
        help("Writers drain the buffer in batches; a zero batch makes no progress.")
    )]
    EmptyBatch,

    #[error("{0} must be greater than zero")]
    #[diagnostic(
        code(config::zero_duration),
        help("Zero intervals degenerate into busy loops; supply a positive duration.")
    )]
    ZeroDuration(String),

    #[error("Store capacity must be at least 1 record")]
    #[diagnostic(
        code(config::empty_store),
        help("max_records bounds store memory; zero would reject every batch.")
    )]
    EmptyStore,

    #[error("Max payload size must be at least 1 byte")]
    #[diagnostic(
        code(config::zero_payload),
        help("Payload truncation needs a positive bound to truncate to.")
    )]
    ZeroPayload,

    #[error("Structural parameter {0} cannot change at runtime")]
    #[diagnostic(
        code(config::structural_change),
        help("Buffer capacity and shard count are fixed at startup; restart the pipeline to change them.")
    )]
    StructuralChange(String),
}

/// Store write failures, retried batch-wise by the owning Writer
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum StoreError {
    #[error("Store capacity exhausted: batch of {requested} exceeds {available} free records")]
    #[diagnostic(
        code(store::capacity_exhausted),
        help("Retry after retention pruning frees space, or raise store.max_records.")
    )]
    CapacityExhausted { requested: usize, available: usize },
}

/// Top-level pipeline errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("Pipeline is shutting down")]
    #[diagnostic(
        code(pipeline::shutting_down),
        help("Operations are rejected once shutdown has begun.")
    )]
    ShuttingDown,
}
