/*!
 * TraceBus
 * Asynchronous event capture, correlation, and storage pipeline
 *
 * Producers stage events through a lock-free buffer; a supervised pool of
 * Writers drains them in batches, reconstructs causal relationships, and
 * persists the enriched records in an indexed in-memory store.
 */

pub mod buffer;
pub mod core;
pub mod correlate;
pub mod events;
pub mod ingest;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod writer;

// Re-exports
pub use buffer::{BufferStats, ReadBatch, StagingBuffer, WriteOutcome};
pub use self::core::config::{OverflowPolicy, PipelineConfig};
pub use self::core::errors::{BufferError, ConfigError, PipelineError, RejectReason, StoreError};
pub use self::core::id::{CorrelationId, CursorId, EventId};
pub use self::core::types::{MonoNs, Pid, WallNs};
pub use correlate::Correlator;
pub use events::{CanonicalEvent, CausalLink, CorrelatedEvent, EventKind, LinkKind, Payload, RawEvent};
pub use ingest::{EventIngestor, IngestStatus};
pub use pipeline::{PipelineManager, PipelineStats};
pub use store::{EventStore, Order, QueryOptions, TimeRange};
pub use telemetry::init_tracing;
pub use writer::{PoolSnapshot, WriterPool};
