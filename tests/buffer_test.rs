/*!
 * Staging Buffer Tests
 * Publish-barrier safety, cursor boundedness, and overflow policies
 */

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracebus::core::config::{BufferConfig, OverflowPolicy};
use tracebus::events::{CanonicalEvent, EventKind, Payload};
use tracebus::{EventId, RejectReason, StagingBuffer, WriteOutcome};

fn buffer(capacity: usize, policy: OverflowPolicy) -> StagingBuffer {
    StagingBuffer::with_config(BufferConfig {
        capacity,
        policy,
        block_timeout: Duration::from_millis(2),
    })
    .unwrap()
}

fn event(n: u64) -> CanonicalEvent {
    CanonicalEvent {
        id: EventId(n),
        kind: EventKind::Custom,
        pid: n % 3,
        correlation_hint: None,
        mono_ns: n,
        wall_ns: n,
        payload: Payload::Opaque {
            type_hint: "n".to_string(),
            bytes: n.to_le_bytes().to_vec(),
        },
    }
}

#[test]
fn test_drop_oldest_overflow_semantics() {
    // Capacity 8, 10 rapid writes: positions 0 and 1 are evicted, a full
    // read yields items 2..=9 in order, and the drop counter reads 2
    let buffer = buffer(8, OverflowPolicy::DropOldest);
    for n in 0..10 {
        assert!(matches!(
            buffer.try_write(event(n)),
            WriteOutcome::Accepted { .. }
        ));
    }

    assert_eq!(buffer.dropped(), 2);

    let cursor = buffer.register_cursor();
    let batch = buffer.read_batch(cursor, 64).unwrap();
    let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
    assert_eq!(monos, (2..10).collect::<Vec<u64>>());
}

#[test]
fn test_drop_newest_overflow_semantics() {
    let buffer = buffer(8, OverflowPolicy::DropNewest);
    let cursor = buffer.register_cursor();

    for n in 0..8 {
        assert!(matches!(
            buffer.try_write(event(n)),
            WriteOutcome::Accepted { .. }
        ));
    }
    for n in 8..20 {
        assert_eq!(
            buffer.try_write(event(n)),
            WriteOutcome::Rejected(RejectReason::BufferFull)
        );
    }

    // Previously accepted contents are unchanged and readable
    let batch = buffer.read_batch(cursor, 64).unwrap();
    let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
    assert_eq!(monos, (0..8).collect::<Vec<u64>>());
}

#[test]
fn test_slow_cursor_is_bumped_not_corrupted() {
    let buffer = buffer(4, OverflowPolicy::DropOldest);
    let slow = buffer.register_cursor();

    for n in 0..10 {
        buffer.try_write(event(n));
    }

    // The slow cursor lost 6 events to eviction but reads the survivors in
    // order, each one intact
    let batch = buffer.read_batch(slow, 64).unwrap();
    let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();
    assert_eq!(monos, vec![6, 7, 8, 9]);
    assert_eq!(buffer.dropped(), 6);
}

#[test]
fn test_concurrent_producers_and_consumer_under_eviction() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::thread;

    let buffer = Arc::new(buffer(32, OverflowPolicy::DropOldest));
    let cursor = buffer.register_cursor();
    let total_per_producer = 500u64;

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                // Injected scheduling delays shake out publish-order races
                let mut rng = StdRng::seed_from_u64(p);
                for n in 0..total_per_producer {
                    buffer.try_write(event(p * 10_000 + n));
                    match rng.gen_range(0..100) {
                        0 => thread::sleep(Duration::from_micros(rng.gen_range(1..50))),
                        1..=10 => thread::yield_now(),
                        _ => {}
                    }
                }
            })
        })
        .collect();

    let mut seen: Vec<u64> = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        let batch = buffer.read_batch(cursor, 64).unwrap();
        for event in &batch.events {
            // Publish-barrier safety: payload and header always agree
            match &event.payload {
                Payload::Opaque { bytes, .. } => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    assert_eq!(u64::from_le_bytes(raw), event.mono_ns);
                }
                other => panic!("torn slot: {other:?}"),
            }
            seen.push(event.mono_ns);
        }
        buffer.commit_cursor(cursor, batch.next_position);

        if producers.iter().all(|p| p.is_finished()) && batch.is_empty() {
            break;
        }
    }

    for producer in producers {
        producer.join().unwrap();
    }

    // Per-producer order is preserved for every event that survived
    for p in 0..4u64 {
        let series: Vec<u64> = seen.iter().copied().filter(|m| m / 10_000 == p).collect();
        let mut sorted = series.clone();
        sorted.sort_unstable();
        assert_eq!(series, sorted, "producer {p} events out of order");
    }

    // Nothing vanished without being counted
    let stats = buffer.stats();
    assert_eq!(
        stats.accepted,
        4 * total_per_producer,
        "all writes accepted under drop_oldest"
    );
    assert!(seen.len() as u64 + stats.dropped >= 4 * total_per_producer);
}

proptest! {
    /// Model check against a FIFO under drop_newest: every read batch is the
    /// exact next slice of accepted events, and the cursor never passes the
    /// write position.
    #[test]
    fn prop_drop_newest_matches_fifo_model(ops in proptest::collection::vec(0u8..3, 1..120)) {
        let buffer = buffer(8, OverflowPolicy::DropNewest);
        let cursor = buffer.register_cursor();

        let mut model: Vec<u64> = Vec::new();
        let mut model_cursor = 0usize;
        let mut next = 0u64;

        for op in ops {
            match op {
                // Write one event
                0 => {
                    match buffer.try_write(event(next)) {
                        WriteOutcome::Accepted { .. } => model.push(next),
                        WriteOutcome::Rejected(_) => {
                            prop_assert!(model.len() - model_cursor == 8);
                        }
                    }
                    next += 1;
                }
                // Read a batch without committing: same slice twice
                1 => {
                    let batch = buffer.read_batch(cursor, 3).unwrap();
                    let expected: Vec<u64> = model[model_cursor..]
                        .iter()
                        .copied()
                        .take(3)
                        .collect();
                    let got: Vec<u64> =
                        batch.events.iter().map(|e| e.mono_ns).collect();
                    prop_assert_eq!(got, expected);
                    prop_assert!(batch.next_position <= buffer.write_position());
                }
                // Read and commit
                _ => {
                    let batch = buffer.read_batch(cursor, 3).unwrap();
                    let took = batch.events.len();
                    buffer.commit_cursor(cursor, batch.next_position);
                    model_cursor += took;
                    prop_assert!(batch.next_position <= buffer.write_position());
                }
            }
        }
    }

    /// Under drop_oldest, any full read is a contiguous, in-order suffix of
    /// everything written, and drops are exactly accounted for.
    #[test]
    fn prop_drop_oldest_reads_contiguous_suffix(total in 1u64..64) {
        let buffer = buffer(8, OverflowPolicy::DropOldest);
        for n in 0..total {
            buffer.try_write(event(n));
        }

        let cursor = buffer.register_cursor();
        let batch = buffer.read_batch(cursor, 128).unwrap();
        let monos: Vec<u64> = batch.events.iter().map(|e| e.mono_ns).collect();

        let dropped = buffer.dropped();
        prop_assert_eq!(dropped, total.saturating_sub(8));
        prop_assert_eq!(monos, (dropped..total).collect::<Vec<u64>>());
    }
}
