/*!
 * Core Module
 * Shared types, errors, limits, identifiers, and configuration
 */

pub mod config;
pub mod errors;
pub mod id;
pub mod limits;
pub mod shard;
pub mod types;

pub use config::{
    BufferConfig, ConfigCell, CorrelationConfig, IngestConfig, OverflowPolicy, PipelineConfig,
    StoreConfig, WriterConfig,
};
pub use errors::{BufferError, ConfigError, PipelineError, RejectReason, StoreError};
pub use id::{CorrelationId, CorrelationIdGenerator, CursorId, EventId, EventIdGenerator};
pub use shard::{ShardPlan, WorkloadProfile};
pub use types::{MonoNs, Pid, WallNs};
