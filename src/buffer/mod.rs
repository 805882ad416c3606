/*!
 * Staging Buffer
 * Lock-free, fixed-capacity circular buffer between producers and Writers
 *
 * Design: many concurrent producers claim positions on an atomic write
 * position; a slot becomes visible to readers only once its sequence word is
 * published (Release store) - the publish barrier. Multiple independent reader
 * cursors consume without dequeuing; the eviction floor tracks the minimum of
 * all registered cursors, and slots behind it are reclaimed for reuse.
 *
 * Read validation is seqlock-style: a reader checks the slot sequence, loads
 * the event, then re-checks floor and sequence. A slot is only reclaimed after
 * the floor has passed it, so a validated read is always the fully-published
 * event for that position - no reader ever observes a torn slot.
 */

use crate::core::config::{BufferConfig, OverflowPolicy};
use crate::core::errors::{BufferError, RejectReason};
use crate::core::id::{CursorId, CursorIdGenerator};
use crate::events::CanonicalEvent;
use ahash::RandomState;
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One buffer slot: publish sequence plus the staged event
///
/// A slot at index `i` holds position `p` (where `p & mask == i`) once
/// `seq == p + 1`. The off-by-one keeps 0 as "never published".
struct Slot {
    seq: AtomicU64,
    event: ArcSwapOption<CanonicalEvent>,
}

/// Outcome of a producer write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted { position: u64 },
    Rejected(RejectReason),
}

/// One batch read from a cursor
///
/// `next_position` is where the cursor lands if this batch is committed;
/// the registered cursor itself only moves on `commit_cursor`.
#[derive(Debug)]
pub struct ReadBatch {
    pub events: Vec<Arc<CanonicalEvent>>,
    pub next_position: u64,
}

impl ReadBatch {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffer statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub write_position: u64,
    pub floor: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub rejected: u64,
    /// Unconsumed events behind the slowest registered cursor
    pub lag: u64,
}

/// Fixed-capacity MPMC staging buffer with independent reader cursors
pub struct StagingBuffer {
    slots: Box<[Slot]>,
    mask: u64,
    capacity: u64,
    policy: OverflowPolicy,
    block_timeout: std::time::Duration,

    /// Next unclaimed position; the only state shared by all producers
    write_pos: AtomicU64,
    /// Oldest retained position; slots behind it are reclaimable
    floor: AtomicU64,

    cursors: DashMap<CursorId, Arc<AtomicU64>, RandomState>,
    cursor_ids: CursorIdGenerator,

    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

enum SlotRead {
    Published(Arc<CanonicalEvent>),
    Unpublished,
    Reclaimed,
}

impl StagingBuffer {
    /// Create a buffer; capacity must be a nonzero power of two
    pub fn with_config(config: BufferConfig) -> Result<Self, BufferError> {
        if config.capacity == 0 || !config.capacity.is_power_of_two() {
            return Err(BufferError::InvalidCapacity(config.capacity));
        }

        let slots = (0..config.capacity)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                event: ArcSwapOption::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: (config.capacity - 1) as u64,
            capacity: config.capacity as u64,
            policy: config.policy,
            block_timeout: config.block_timeout,
            write_pos: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            cursors: DashMap::with_hasher(RandomState::new()),
            cursor_ids: CursorIdGenerator::new(),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Stage an event; never blocks beyond the configured `block` timeout
    pub fn try_write(&self, event: CanonicalEvent) -> WriteOutcome {
        match self.claim() {
            Ok(pos) => {
                let slot = &self.slots[(pos & self.mask) as usize];
                slot.event.store(Some(Arc::new(event)));
                // Publish barrier: readers trust the slot only after this
                slot.seq.store(pos + 1, Ordering::Release);
                self.accepted.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::Accepted { position: pos }
            }
            Err(reason) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::Rejected(reason)
            }
        }
    }

    /// Claim the next write position, applying the overflow policy when full
    ///
    /// A CAS loop rather than a blind fetch-add: a rejected claim must not
    /// leave an unpublishable hole that readers would wait on forever.
    fn claim(&self) -> Result<u64, RejectReason> {
        let deadline = match self.policy {
            OverflowPolicy::Block => Some(Instant::now() + self.block_timeout),
            _ => None,
        };

        loop {
            let pos = self.write_pos.load(Ordering::Acquire);
            let floor = self.floor.load(Ordering::Acquire);

            if pos - floor >= self.capacity {
                // Reclaim slots every registered cursor has consumed before
                // treating the buffer as full
                if self.reclaim_consumed(floor) {
                    continue;
                }
                // Another producer may have advanced the floor meanwhile
                if self.floor.load(Ordering::Acquire) != floor {
                    continue;
                }
                match self.policy {
                    OverflowPolicy::DropNewest => return Err(RejectReason::BufferFull),
                    OverflowPolicy::DropOldest => {
                        self.evict_oldest(floor);
                        continue;
                    }
                    OverflowPolicy::Block => {
                        match deadline {
                            Some(d) if Instant::now() < d => {
                                std::hint::spin_loop();
                                std::thread::yield_now();
                                continue;
                            }
                            _ => return Err(RejectReason::Timeout),
                        }
                    }
                }
            }

            if self
                .write_pos
                .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(pos);
            }
        }
    }

    /// Advance the floor over slots all cursors have read; not a drop
    fn reclaim_consumed(&self, floor: u64) -> bool {
        let mut min = u64::MAX;
        for entry in self.cursors.iter() {
            min = min.min(entry.value().load(Ordering::Acquire));
        }
        if min == u64::MAX || min <= floor {
            return false;
        }
        self.floor.fetch_max(min, Ordering::AcqRel) < min
    }

    /// Drop the oldest unread slot: floor forward, count it, bump laggards
    fn evict_oldest(&self, floor: u64) {
        if self
            .floor
            .compare_exchange(floor, floor + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            for entry in self.cursors.iter() {
                entry.value().fetch_max(floor + 1, Ordering::AcqRel);
            }
        }
    }

    /// Register an independent reader cursor, starting at the current floor
    pub fn register_cursor(&self) -> CursorId {
        let id = self.cursor_ids.next();
        let start = self.floor.load(Ordering::Acquire);
        self.cursors.insert(id, Arc::new(AtomicU64::new(start)));
        id
    }

    /// Remove a cursor; its ID may be recycled for a later registration
    pub fn deregister_cursor(&self, id: CursorId) {
        if self.cursors.remove(&id).is_some() {
            self.cursor_ids.recycle(id);
        }
    }

    /// Read up to `max` published events from a cursor without advancing it
    ///
    /// Non-blocking: with no new data this returns an empty batch
    /// immediately. The cursor never passes the last published position.
    pub fn read_batch(&self, cursor: CursorId, max: usize) -> Result<ReadBatch, BufferError> {
        let position = self
            .cursors
            .get(&cursor)
            .ok_or(BufferError::UnknownCursor(cursor.0))?
            .value()
            .load(Ordering::Acquire);

        let mut pos = position.max(self.floor.load(Ordering::Acquire));
        let mut events = Vec::new();

        while events.len() < max {
            match self.read_at(pos) {
                SlotRead::Published(event) => {
                    events.push(event);
                    pos += 1;
                }
                SlotRead::Unpublished => break,
                SlotRead::Reclaimed => {
                    // The slot was evicted from under us; resume at the floor
                    pos = self.floor.load(Ordering::Acquire).max(pos + 1);
                }
            }
        }

        Ok(ReadBatch {
            events,
            next_position: pos,
        })
    }

    /// Commit a cursor to `position`, making the consumed slots reclaimable
    ///
    /// Monotonic (fetch-max): a concurrent eviction that already bumped the
    /// cursor past `position` wins.
    pub fn commit_cursor(&self, cursor: CursorId, position: u64) {
        if let Some(entry) = self.cursors.get(&cursor) {
            entry.value().fetch_max(position, Ordering::AcqRel);
        }
    }

    fn read_at(&self, pos: u64) -> SlotRead {
        let slot = &self.slots[(pos & self.mask) as usize];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq < pos + 1 {
            return SlotRead::Unpublished;
        }
        if seq > pos + 1 {
            return SlotRead::Reclaimed;
        }

        let event = slot.event.load_full();

        // A reclaiming writer advances the floor before storing over the
        // slot; floor still behind us means the load above saw our event
        if self.floor.load(Ordering::Acquire) > pos {
            return SlotRead::Reclaimed;
        }
        if slot.seq.load(Ordering::Acquire) != pos + 1 {
            return SlotRead::Reclaimed;
        }

        match event {
            Some(event) => SlotRead::Published(event),
            None => SlotRead::Unpublished,
        }
    }

    /// Last claimed write position
    #[inline]
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Oldest retained position
    #[inline]
    pub fn floor(&self) -> u64 {
        self.floor.load(Ordering::Acquire)
    }

    /// Events dropped by `drop_oldest` eviction
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        let write_position = self.write_pos.load(Ordering::Acquire);
        let mut min_cursor = u64::MAX;
        for entry in self.cursors.iter() {
            min_cursor = min_cursor.min(entry.value().load(Ordering::Acquire));
        }
        let lag = if min_cursor == u64::MAX {
            0
        } else {
            write_position.saturating_sub(min_cursor)
        };

        BufferStats {
            capacity: self.capacity as usize,
            write_position,
            floor: self.floor.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            lag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::EventIdGenerator;
    use crate::events::{EventKind, Payload};
    use std::time::Duration;

    fn config(capacity: usize, policy: OverflowPolicy) -> BufferConfig {
        BufferConfig {
            capacity,
            policy,
            block_timeout: Duration::from_millis(1),
        }
    }

    fn event(n: u64) -> CanonicalEvent {
        CanonicalEvent {
            id: EventIdGenerator::new().next(n * 1_000_000),
            kind: EventKind::Custom,
            pid: 1,
            correlation_hint: None,
            mono_ns: n,
            wall_ns: n,
            payload: Payload::Opaque {
                type_hint: "test".to_string(),
                bytes: n.to_le_bytes().to_vec(),
            },
        }
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        let err = StagingBuffer::with_config(config(100, OverflowPolicy::DropNewest));
        assert!(matches!(err, Err(BufferError::InvalidCapacity(100))));

        let err = StagingBuffer::with_config(config(0, OverflowPolicy::DropNewest));
        assert!(matches!(err, Err(BufferError::InvalidCapacity(0))));
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropNewest)).unwrap();
        let cursor = buffer.register_cursor();

        for n in 0..3 {
            assert!(matches!(
                buffer.try_write(event(n)),
                WriteOutcome::Accepted { .. }
            ));
        }

        let batch = buffer.read_batch(cursor, 16).unwrap();
        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.next_position, 3);
        let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
        assert_eq!(monos, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_read_returns_immediately() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropNewest)).unwrap();
        let cursor = buffer.register_cursor();

        let batch = buffer.read_batch(cursor, 16).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.next_position, 0);
    }

    #[test]
    fn test_unknown_cursor_errors() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropNewest)).unwrap();
        assert!(matches!(
            buffer.read_batch(CursorId(99), 1),
            Err(BufferError::UnknownCursor(99))
        ));
    }

    #[test]
    fn test_drop_oldest_evicts_earliest() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropOldest)).unwrap();

        for n in 0..10 {
            assert!(matches!(
                buffer.try_write(event(n)),
                WriteOutcome::Accepted { .. }
            ));
        }
        assert_eq!(buffer.dropped(), 2);

        let cursor = buffer.register_cursor();
        let batch = buffer.read_batch(cursor, 16).unwrap();
        let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
        assert_eq!(monos, (2..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_drop_newest_rejects_and_preserves() {
        let buffer = StagingBuffer::with_config(config(4, OverflowPolicy::DropNewest)).unwrap();
        let cursor = buffer.register_cursor();

        for n in 0..4 {
            assert!(matches!(
                buffer.try_write(event(n)),
                WriteOutcome::Accepted { .. }
            ));
        }
        for n in 4..8 {
            assert_eq!(
                buffer.try_write(event(n)),
                WriteOutcome::Rejected(RejectReason::BufferFull)
            );
        }

        let batch = buffer.read_batch(cursor, 16).unwrap();
        let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
        assert_eq!(monos, vec![0, 1, 2, 3]);
        assert_eq!(buffer.stats().rejected, 4);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_block_times_out_to_rejection() {
        let buffer = StagingBuffer::with_config(config(2, OverflowPolicy::Block)).unwrap();
        let _cursor = buffer.register_cursor();

        assert!(matches!(
            buffer.try_write(event(0)),
            WriteOutcome::Accepted { .. }
        ));
        assert!(matches!(
            buffer.try_write(event(1)),
            WriteOutcome::Accepted { .. }
        ));

        let start = Instant::now();
        assert_eq!(
            buffer.try_write(event(2)),
            WriteOutcome::Rejected(RejectReason::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_block_reclaims_after_commit() {
        let buffer = StagingBuffer::with_config(config(2, OverflowPolicy::Block)).unwrap();
        let cursor = buffer.register_cursor();

        buffer.try_write(event(0));
        buffer.try_write(event(1));

        let batch = buffer.read_batch(cursor, 16).unwrap();
        buffer.commit_cursor(cursor, batch.next_position);

        // Consumed slots are reclaimable, so the write goes through
        assert!(matches!(
            buffer.try_write(event(2)),
            WriteOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn test_uncommitted_cursor_rereads_same_batch() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropNewest)).unwrap();
        let cursor = buffer.register_cursor();

        for n in 0..3 {
            buffer.try_write(event(n));
        }

        let first = buffer.read_batch(cursor, 16).unwrap();
        let again = buffer.read_batch(cursor, 16).unwrap();
        assert_eq!(first.events.len(), again.events.len());
        assert_eq!(first.next_position, again.next_position);

        buffer.commit_cursor(cursor, first.next_position);
        let after = buffer.read_batch(cursor, 16).unwrap();
        assert!(after.is_empty());
    }

    #[test]
    fn test_independent_cursors() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropNewest)).unwrap();
        let fast = buffer.register_cursor();
        let slow = buffer.register_cursor();

        for n in 0..4 {
            buffer.try_write(event(n));
        }

        let batch = buffer.read_batch(fast, 16).unwrap();
        buffer.commit_cursor(fast, batch.next_position);

        // The slow cursor still sees everything
        let batch = buffer.read_batch(slow, 16).unwrap();
        assert_eq!(batch.events.len(), 4);
    }

    #[test]
    fn test_cursor_never_passes_write_position() {
        let buffer = StagingBuffer::with_config(config(8, OverflowPolicy::DropOldest)).unwrap();
        let cursor = buffer.register_cursor();

        for n in 0..5 {
            buffer.try_write(event(n));
            let batch = buffer.read_batch(cursor, 16).unwrap();
            assert!(batch.next_position <= buffer.write_position());
            buffer.commit_cursor(cursor, batch.next_position);
        }
    }

    #[test]
    fn test_concurrent_producers_no_torn_reads() {
        use std::thread;

        let buffer =
            Arc::new(StagingBuffer::with_config(config(64, OverflowPolicy::Block)).unwrap());
        let cursor = buffer.register_cursor();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for n in 0..200u64 {
                        let mono = p * 1_000 + n;
                        while !matches!(
                            buffer.try_write(event(mono)),
                            WriteOutcome::Accepted { .. }
                        ) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 800 {
            let batch = buffer.read_batch(cursor, 64).unwrap();
            for event in &batch.events {
                // A published event always round-trips intact: the payload
                // bytes must match the mono timestamp written with them
                match &event.payload {
                    Payload::Opaque { bytes, .. } => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(bytes);
                        assert_eq!(u64::from_le_bytes(raw), event.mono_ns);
                    }
                    other => panic!("unexpected payload {other:?}"),
                }
                seen.push(event.mono_ns);
            }
            buffer.commit_cursor(cursor, batch.next_position);
        }

        for producer in producers {
            producer.join().unwrap();
        }

        // Per-producer FIFO order survives interleaving
        for p in 0..4u64 {
            let series: Vec<u64> = seen
                .iter()
                .copied()
                .filter(|m| m / 1_000 == p)
                .collect();
            assert_eq!(series, (0..200).map(|n| p * 1_000 + n).collect::<Vec<_>>());
        }
    }
}
