/*!
 * Event Ingestion
 * Hot-path transform from a raw capture call into a staged canonical event
 *
 * Stateless apart from ID generation and two counters; safe from arbitrarily
 * many producer contexts. Returns in bounded time regardless of buffer state
 * and never retries internally - the caller decides how to react to a
 * rejection.
 */

use crate::buffer::{StagingBuffer, WriteOutcome};
use crate::core::config::ConfigCell;
use crate::core::errors::RejectReason;
use crate::core::id::{EventId, EventIdGenerator};
use crate::events::{now_mono_ns, now_wall_ns, CanonicalEvent, RawEvent};
use ahash::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of an ingestion call, returned synchronously to the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Accepted { id: EventId },
    Rejected(RejectReason),
}

impl IngestStatus {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Producer-facing ingestion front end
///
/// Routes each event to a staging shard by a fixed hash of its originating
/// process, so one process always lands on one shard (partition affinity
/// preserves per-process FIFO through a single Writer).
pub struct EventIngestor {
    shards: Arc<Vec<Arc<StagingBuffer>>>,
    ids: EventIdGenerator,
    config: Arc<ConfigCell>,
    route: RandomState,
    ingested: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl EventIngestor {
    pub fn new(shards: Arc<Vec<Arc<StagingBuffer>>>, config: Arc<ConfigCell>) -> Self {
        debug_assert!(shards.len().is_power_of_two());
        Self {
            shards,
            ids: EventIdGenerator::new(),
            config,
            route: RandomState::new(),
            ingested: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Canonicalize and stage one event
    #[inline]
    pub fn ingest(&self, raw: RawEvent) -> IngestStatus {
        let max_payload = self.config.load().ingest.max_payload_bytes;

        let payload = if raw.payload.approx_size() > max_payload {
            raw.payload.truncation_marker()
        } else {
            raw.payload
        };

        let wall_ns = if raw.wall_ns == 0 {
            now_wall_ns()
        } else {
            raw.wall_ns
        };
        let mono_ns = if raw.mono_ns == 0 {
            now_mono_ns()
        } else {
            raw.mono_ns
        };

        let id = self.ids.next(wall_ns);
        let event = CanonicalEvent {
            id,
            kind: raw.kind,
            pid: raw.pid,
            correlation_hint: raw.correlation_hint,
            mono_ns,
            wall_ns,
            payload,
        };

        let shard = (self.route.hash_one(raw.pid) as usize) & (self.shards.len() - 1);
        match self.shards[shard].try_write(event) {
            WriteOutcome::Accepted { .. } => {
                self.ingested.fetch_add(1, Ordering::Relaxed);
                IngestStatus::Accepted { id }
            }
            WriteOutcome::Rejected(reason) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                IngestStatus::Rejected(reason)
            }
        }
    }

    /// Events accepted into staging
    #[inline]
    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    /// Events turned away at staging
    #[inline]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Clone for EventIngestor {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
            ids: self.ids.clone(),
            config: Arc::clone(&self.config),
            route: self.route.clone(),
            ingested: Arc::clone(&self.ingested),
            rejected: Arc::clone(&self.rejected),
        }
    }
}
