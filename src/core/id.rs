/*!
 * ID Generation System
 * Centralized ID management with type-safe wrappers and recycling support
 */

use crate::core::limits::{EVENT_ID_SEQ_BITS, EVENT_ID_SEQ_MASK};
use crate::core::types::WallNs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Type-Safe ID Wrappers
// ============================================================================

/// Globally unique, roughly time-sortable event identifier
///
/// Layout: wall-clock milliseconds in the high 42 bits, a monotonic sequence
/// in the low bits. Sorting by raw value approximates sorting by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

/// Identifier linking causally related events
///
/// Issued from a monotonic counter; an ID, once assigned, is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

/// Registered reader cursor handle (32-bit, recycled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorId(pub u32);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EventId {
    /// Wall-clock milliseconds component
    #[inline]
    pub fn millis(self) -> u64 {
        self.0 >> EVENT_ID_SEQ_BITS
    }

    /// Sequence component
    #[inline]
    pub fn seq(self) -> u64 {
        self.0 & EVENT_ID_SEQ_MASK
    }
}

// ============================================================================
// Event ID Generator
// ============================================================================

/// Lock-free event ID generator
///
/// Combines the event's wall-clock milliseconds with a process-wide atomic
/// sequence. Two events in the same millisecond differ in the sequence bits;
/// events in different milliseconds differ in the time bits.
#[repr(C, align(64))]
pub struct EventIdGenerator {
    counter: Arc<AtomicU64>,
}

impl EventIdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mint the ID for an event carrying the given wall timestamp
    #[inline]
    pub fn next(&self, wall_ns: WallNs) -> EventId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = wall_ns / 1_000_000;
        EventId((millis << EVENT_ID_SEQ_BITS) | (seq & EVENT_ID_SEQ_MASK))
    }

    /// Number of IDs minted so far
    #[inline]
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventIdGenerator {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
        }
    }
}

// ============================================================================
// Correlation ID Generator
// ============================================================================

/// Monotonic correlation ID source
///
/// Plain atomic increment: IDs are never recycled, satisfying the invariant
/// that a correlation ID is never reused.
#[repr(C, align(64))]
pub struct CorrelationIdGenerator {
    counter: Arc<AtomicU64>,
}

impl CorrelationIdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    #[inline]
    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CorrelationIdGenerator {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
        }
    }
}

// ============================================================================
// Cursor ID Generator (recycling)
// ============================================================================

/// Cursor ID generator with recycling support
///
/// Uses a lock-free queue for recycled IDs and falls back to an atomic counter
/// when none are available. Cursors come and go with Writer rescaling, so
/// recycling prevents ID exhaustion in long-running pipelines.
pub struct CursorIdGenerator {
    counter: Arc<AtomicU32>,
    free_list: Arc<crossbeam_queue::SegQueue<u32>>,
}

impl CursorIdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(1)),
            free_list: Arc::new(crossbeam_queue::SegQueue::new()),
        }
    }

    #[inline]
    pub fn next(&self) -> CursorId {
        CursorId(
            self.free_list
                .pop()
                .unwrap_or_else(|| self.counter.fetch_add(1, Ordering::SeqCst)),
        )
    }

    #[inline]
    pub fn recycle(&self, id: CursorId) {
        self.free_list.push(id.0);
    }
}

impl Default for CursorIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CursorIdGenerator {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            free_list: Arc::clone(&self.free_list),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
