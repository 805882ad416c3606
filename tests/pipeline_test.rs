/*!
 * Pipeline Integration Tests
 * End-to-end: ingest through staging, correlation, and storage to queries
 */

use std::time::Duration;
use tracebus::core::config::PipelineConfig;
use tracebus::events::{EventKind, LinkKind, RawEvent};
use tracebus::{
    ConfigError, IngestStatus, PipelineManager, PipelineStats, QueryOptions, TimeRange,
};

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.shard_count = 2;
    config.buffer.capacity = 1024;
    config.writers.count = 2;
    config.writers.poll_interval = Duration::from_millis(2);
    config.writers.backoff_initial = Duration::from_millis(5);
    config.correlation.sweep_interval = Duration::from_millis(20);
    config.store.prune_interval = Duration::from_millis(20);
    config
}

/// Poll the pipeline until `check` passes or the timeout elapses
async fn drain_until(
    pipeline: &PipelineManager,
    timeout: Duration,
    check: impl Fn(&PipelineStats) -> bool,
) -> PipelineStats {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stats = pipeline.stats();
        if check(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not drain in time: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_ingest_roundtrip_to_time_query() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    let status = pipeline.ingest(RawEvent::call_enter(7, "handle_request", "{}").at(5_000, 0));
    let id = match status {
        IngestStatus::Accepted { id } => id,
        other => panic!("ingest rejected: {other:?}"),
    };

    drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 1).await;

    let hits = pipeline.query_by_time(TimeRange::new(5_000, 5_001), &QueryOptions::new());
    assert_eq!(hits.len(), 1);
    let hit = &hits[0];
    assert_eq!(hit.id(), id);
    assert_eq!(hit.pid(), 7);
    assert_eq!(hit.mono_ns(), 5_000);
    assert_eq!(hit.event.kind, EventKind::CallEnter);
    assert_eq!(hit.event.function(), Some("handle_request"));
    assert!(!hit.orphan);

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_call_tree_end_to_end() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    pipeline.ingest(RawEvent::call_enter(1, "outer", "").at(100, 0));
    pipeline.ingest(RawEvent::call_enter(1, "inner", "").at(200, 0));
    pipeline.ingest(RawEvent::call_exit(1, "inner", "").at(300, 0));
    pipeline.ingest(RawEvent::call_exit(1, "outer", "").at(600, 0));

    drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 4).await;

    let outer = pipeline.query_by_function("outer", &QueryOptions::new());
    let inner = pipeline.query_by_function("inner", &QueryOptions::new());
    assert_eq!(outer.len(), 2);
    assert_eq!(inner.len(), 2);

    let outer_enter = &outer[0];
    let inner_enter = &inner[0];
    let inner_exit = &inner[1];
    let outer_exit = &outer[1];

    assert_eq!(outer_enter.parent_id, None);
    assert_eq!(inner_enter.parent_id, Some(outer_enter.correlation_id));
    assert_eq!(inner_exit.duration_ns, Some(100));
    assert_eq!(outer_exit.duration_ns, Some(500));
    assert!(outer_exit.duration_ns >= inner_exit.duration_ns);

    // The whole call context is reachable through one correlation ID
    let tree = pipeline.query_by_correlation(outer_enter.correlation_id, &QueryOptions::new());
    assert_eq!(tree.len(), 2);

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_message_pair_end_to_end() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    pipeline.ingest(RawEvent::message_send(1, 2, "payload 9").at(100, 0));
    pipeline.ingest(RawEvent::message_receive(1, 2, "payload 9").at(200, 0));

    let stats = drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 2).await;
    assert_eq!(stats.correlation.matched, 1);

    let sent = pipeline.query_by_process(1, &QueryOptions::new());
    let received = pipeline.query_by_process(2, &QueryOptions::new());
    assert_eq!(sent.len(), 1);
    assert_eq!(received.len(), 1);
    assert!(received[0]
        .links
        .iter()
        .any(|l| l.other == sent[0].correlation_id && l.kind == LinkKind::MessagePair));

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_unmatched_receive_stored_as_orphan_after_ttl() {
    let mut config = fast_config();
    config.correlation.pending_ttl = Duration::from_millis(10);
    let pipeline = PipelineManager::start(config).unwrap();

    pipeline.ingest(RawEvent::message_receive(3, 4, "from nowhere").at(100, 0));

    // Held past the TTL, then swept into the store as one explicit orphan
    let stats = drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 1).await;
    assert_eq!(stats.correlation.orphaned, 1);

    let hits = pipeline.query_by_process(4, &QueryOptions::new());
    assert_eq!(hits.len(), 1);
    assert!(hits[0].orphan);

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_store_capacity_failure_retries_without_loss() {
    let mut config = fast_config();
    config.writers.count = 1;
    config.writers.batch_size = 1;
    config.store.max_records = 4;
    let pipeline = PipelineManager::start(config).unwrap();

    for n in 0..8u64 {
        let status = pipeline.ingest(RawEvent::call_enter(1, "f", "").at(1_000 + n, 0));
        assert!(status.is_accepted());
    }

    // The store fills, write failures surface, count-threshold pruning frees
    // headroom, and every event eventually lands exactly once
    let stats = drain_until(&pipeline, Duration::from_secs(10), |s| {
        s.store.total_written >= 8
    })
    .await;
    assert!(stats.errors.store_write_failures > 0);
    assert!(stats.store_records <= 4);
    assert_eq!(stats.store.duplicates, 0);

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_drop_oldest_counts_surface_in_stats() {
    let mut config = fast_config();
    config.shard_count = 1;
    config.buffer.capacity = 8;
    // Stall draining so overproduction hits the buffer
    config.writers.poll_interval = Duration::from_secs(60);
    let pipeline = PipelineManager::start(config).unwrap();

    for n in 0..12u64 {
        pipeline.ingest(RawEvent::call_enter(1, "f", "").at(n + 1, 0));
    }

    let stats = pipeline.stats();
    assert_eq!(stats.events_ingested, 12);
    assert_eq!(stats.events_dropped, 4);
    assert_eq!(stats.errors.events_dropped, 4);

    pipeline.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_scale_writers_keeps_draining() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    for n in 0..20u64 {
        pipeline.ingest(RawEvent::call_enter(n % 5, "phase_one", "").at(n + 1, 0));
    }
    drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 20).await;

    pipeline.scale_writers(4).unwrap();
    // Give the new generation a moment to take over the shards
    tokio::time::sleep(Duration::from_millis(50)).await;

    for n in 20..40u64 {
        pipeline.ingest(RawEvent::call_enter(n % 5, "phase_two", "").at(n + 1, 0));
    }
    let stats = drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 40).await;

    // No event was lost or double-stored across the rescale
    assert_eq!(stats.store.total_written, 40);
    assert_eq!(stats.store.duplicates, 0);
    assert_eq!(pipeline.stats().workers.active, 4);

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_reconfigure_tunables_and_reject_structural() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    let mut tunable = (*pipeline.config()).clone();
    tunable.writers.batch_size = 64;
    tunable.correlation.pending_ttl = Duration::from_secs(1);
    pipeline.reconfigure(tunable).unwrap();
    assert_eq!(pipeline.config().writers.batch_size, 64);

    let mut structural = (*pipeline.config()).clone();
    structural.buffer.capacity *= 2;
    assert!(matches!(
        pipeline.reconfigure(structural),
        Err(ConfigError::StructuralChange(_))
    ));

    let mut invalid = (*pipeline.config()).clone();
    invalid.writers.batch_size = 0;
    assert!(matches!(
        pipeline.reconfigure(invalid),
        Err(ConfigError::EmptyBatch)
    ));

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_graceful_shutdown_drains_inflight() {
    let pipeline = PipelineManager::start(fast_config()).unwrap();

    for n in 0..50u64 {
        pipeline.ingest(RawEvent::call_enter(n % 3, "work", "").at(n + 1, 0));
    }
    drain_until(&pipeline, Duration::from_secs(5), |s| s.store_records == 50).await;

    pipeline.shutdown(Duration::from_secs(5)).await;
}
