/*!
 * Pipeline Limits and Constants
 *
 * Centralized location for all pipeline-wide limits, thresholds, and defaults.
 * Organized by component for maintainability and discoverability.
 *
 * ## Design Philosophy
 * - All values include rationale comments explaining WHY they exist
 * - Values are grouped by component (buffer, ingest, writers, etc.)
 * - Performance-critical constants are marked with [PERF]
 */

use std::time::Duration;

// =============================================================================
// STAGING BUFFER
// =============================================================================

/// Default staging buffer capacity per shard (64K slots)
/// [PERF] Must be a power of 2 for fast modulo via bitmask
pub const DEFAULT_BUFFER_CAPACITY: usize = 65536;

/// Default number of staging shards
/// [PERF] Must be a power of 2 so process-to-shard routing is a bitmask.
/// One Writer per shard at the default worker count.
pub const DEFAULT_SHARD_COUNT: usize = 4;

/// Default producer wait budget under the `block` overflow policy (5ms)
/// Past this the write degrades to `drop_newest` rejection
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(5);

// =============================================================================
// INGESTION
// =============================================================================

/// Maximum canonical payload size (64KB)
/// Larger payloads are replaced by a truncation marker, never rejected
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Bits of the event ID reserved for the per-process-lifetime sequence
/// [PERF] 22 bits = 4M events per millisecond before high-bit overlap;
/// the remaining 42 bits hold wall-clock milliseconds (rough time ordering)
pub const EVENT_ID_SEQ_BITS: u32 = 22;

/// Mask extracting the sequence component of an event ID
pub const EVENT_ID_SEQ_MASK: u64 = (1 << EVENT_ID_SEQ_BITS) - 1;

// =============================================================================
// WRITER POOL
// =============================================================================

/// Default number of Writer workers
pub const DEFAULT_WRITER_COUNT: usize = 2;

/// Default events per batch (256)
/// Larger batches raise throughput and per-event latency together
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default poll interval between batch reads (10ms)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Initial backoff after a failed persist (50ms)
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(50);

/// Backoff ceiling for a persistently failing Writer (5s)
/// Bounds the retry quiet period so recovery is still prompt
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Default grace period for pipeline shutdown (10s)
/// Writers past this deadline are aborted and their batches counted as dropped
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// CORRELATION
// =============================================================================

/// Default TTL for unmatched pending messages (30s)
/// Past this a pending entry is evicted and surfaced as an orphan
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);

/// Default retention window for correlation metadata and links (5 minutes)
/// Bounds correlator memory regardless of traffic shape
pub const DEFAULT_CORRELATION_RETENTION: Duration = Duration::from_secs(300);

/// Default interval between sweep passes (5s)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// STORE
// =============================================================================

/// Default record capacity of the in-memory store (1M records)
/// A full store rejects batches until retention pruning frees space
pub const DEFAULT_MAX_RECORDS: usize = 1_000_000;

/// Default store retention window (15 minutes)
/// Measured against the newest stored monotonic timestamp
pub const DEFAULT_STORE_RETENTION: Duration = Duration::from_secs(900);

/// Default interval between retention pruning passes (30s)
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// SHARDED STATE
// =============================================================================

/// Shard count bounds for keyed correlation/store state (min/max)
/// [PERF] Auto-calculated from CPU count, clamped to this range
pub const MIN_STATE_SHARDS: usize = 8;
pub const MAX_STATE_SHARDS: usize = 512;
