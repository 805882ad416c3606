/*!
 * Pipeline Manager
 * Wires buffers, ingestion, correlation, writers, and the store together
 *
 * Owns startup and shutdown, exposes the producer-facing ingest call, the
 * query surface, health/metrics, and atomic reconfiguration.
 */

use crate::buffer::{BufferStats, StagingBuffer};
use crate::core::config::{ConfigCell, PipelineConfig};
use crate::core::errors::{ConfigError, RejectReason};
use crate::core::id::{CorrelationId, CursorId};
use crate::core::types::Pid;
use crate::correlate::{CorrelationStats, Correlator};
use crate::events::{CorrelatedEvent, RawEvent};
use crate::ingest::{EventIngestor, IngestStatus};
use crate::store::{EventStore, QueryOptions, StoreStats, TimeRange};
use crate::writer::{PoolSnapshot, WriterContext, WriterPool, WriterPoolStats};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Failure counters surfaced through `stats()`
///
/// Every user-visible failure path increments one of these; there is no code
/// path that drops data without a counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub store_write_failures: u64,
    pub sweep_write_failures: u64,
    pub events_rejected: u64,
    pub events_dropped: u64,
    pub abandoned_batches: u64,
}

/// Health and throughput snapshot of the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub events_ingested: u64,
    pub events_rejected: u64,
    /// Events evicted by `drop_oldest` overflow across all shards
    pub events_dropped: u64,
    pub batches_processed: u64,
    pub correlation_backlog: usize,
    pub store_records: usize,
    pub buffers: Vec<BufferStats>,
    pub correlation: CorrelationStats,
    pub store: StoreStats,
    pub workers: PoolSnapshot,
    pub errors: ErrorCounts,
}

#[derive(Debug)]
enum SweeperCommand {
    Shutdown,
}

/// Top-level pipeline: construction, operation, shutdown
pub struct PipelineManager {
    config: Arc<ConfigCell>,
    shards: Arc<Vec<Arc<StagingBuffer>>>,
    ingestor: EventIngestor,
    correlator: Arc<Correlator>,
    store: Arc<EventStore>,
    pool: Option<WriterPool>,
    sweeper_tx: mpsc::UnboundedSender<SweeperCommand>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
    sweep_failures: Arc<AtomicU64>,
    shutting_down: AtomicBool,
}

impl PipelineManager {
    /// Validate the configuration and start the pipeline
    ///
    /// Must be called inside a tokio runtime; Writers and the sweeper are
    /// spawned immediately.
    pub fn start(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let buffer_config = config.buffer;
        let shard_count = config.shard_count;
        let config = Arc::new(ConfigCell::new(config));

        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let buffer = StagingBuffer::with_config(buffer_config)
                .map_err(|_| ConfigError::CapacityNotPowerOfTwo(buffer_config.capacity))?;
            shards.push(Arc::new(buffer));
        }
        let shards = Arc::new(shards);

        // One persistent cursor per shard; Writers borrow them by assignment
        // and replacements resume from the last committed position
        let cursors: Arc<Vec<CursorId>> =
            Arc::new(shards.iter().map(|shard| shard.register_cursor()).collect());

        let ingestor = EventIngestor::new(Arc::clone(&shards), Arc::clone(&config));
        let correlator = Arc::new(Correlator::new(Arc::clone(&config)));
        let store = Arc::new(EventStore::new(Arc::clone(&config)));
        let stats = Arc::new(WriterPoolStats::default());

        let pool = WriterPool::spawn(WriterContext {
            shards: Arc::clone(&shards),
            cursors,
            correlator: Arc::clone(&correlator),
            store: Arc::clone(&store),
            config: Arc::clone(&config),
            stats,
        });

        let sweep_failures = Arc::new(AtomicU64::new(0));
        let (sweeper_tx, sweeper_rx) = mpsc::unbounded_channel();
        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&correlator),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&sweep_failures),
            sweeper_rx,
        ));

        info!(
            shards = shard_count,
            writers = config.load().writers.count,
            "pipeline started"
        );

        Ok(Self {
            config,
            shards,
            ingestor,
            correlator,
            store,
            pool: Some(pool),
            sweeper_tx,
            sweeper: Some(sweeper),
            sweep_failures,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Producer-facing ingestion call; synchronous, bounded time
    #[inline]
    pub fn ingest(&self, raw: RawEvent) -> IngestStatus {
        if self.shutting_down.load(Ordering::Acquire) {
            return IngestStatus::Rejected(RejectReason::ShuttingDown);
        }
        self.ingestor.ingest(raw)
    }

    /// Records with `start <= mono_ns < end`
    pub fn query_by_time(&self, range: TimeRange, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        self.store.query_by_time(range, opts)
    }

    pub fn query_by_process(&self, pid: Pid, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        self.store.query_by_process(pid, opts)
    }

    pub fn query_by_function(&self, function: &str, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        self.store.query_by_function(function, opts)
    }

    pub fn query_by_correlation(
        &self,
        correlation: CorrelationId,
        opts: &QueryOptions,
    ) -> Vec<Arc<CorrelatedEvent>> {
        self.store.query_by_correlation(correlation, opts)
    }

    /// Direct store handle, for retention control and advanced queries
    pub fn store(&self) -> Arc<EventStore> {
        Arc::clone(&self.store)
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.load()
    }

    /// Aggregate health and throughput counters
    pub fn stats(&self) -> PipelineStats {
        let buffers: Vec<BufferStats> = self.shards.iter().map(|shard| shard.stats()).collect();
        let events_dropped: u64 = buffers.iter().map(|b| b.dropped).sum();
        let workers = self
            .pool
            .as_ref()
            .map(WriterPool::snapshot)
            .unwrap_or_default();
        let correlation = self.correlator.stats();
        let store = self.store.stats();

        PipelineStats {
            events_ingested: self.ingestor.ingested(),
            events_rejected: self.ingestor.rejected(),
            events_dropped,
            batches_processed: workers.batches_processed,
            correlation_backlog: correlation.backlog,
            store_records: store.records,
            errors: ErrorCounts {
                store_write_failures: workers.write_failures,
                sweep_write_failures: self.sweep_failures.load(Ordering::Relaxed),
                events_rejected: self.ingestor.rejected(),
                events_dropped,
                abandoned_batches: workers.abandoned_batches,
            },
            buffers,
            correlation,
            store,
            workers,
        }
    }

    /// Atomically swap the tunable configuration
    ///
    /// Structural parameters (shard count, buffer geometry) are rejected
    /// before taking effect; a writer-count change rescales the pool.
    pub fn reconfigure(&self, new: PipelineConfig) -> Result<(), ConfigError> {
        new.validate()?;
        let current = self.config.load();
        new.check_structural_match(&current)?;

        let new_count = new.writers.count;
        let rescale = new_count != current.writers.count;
        self.config.swap(new);

        if rescale {
            if let Some(pool) = &self.pool {
                pool.scale(new_count);
            }
        }
        info!("pipeline reconfigured");
        Ok(())
    }

    /// Change the Writer count without touching other tunables
    pub fn scale_writers(&self, workers: usize) -> Result<(), ConfigError> {
        if workers == 0 {
            return Err(ConfigError::NoWriters);
        }
        let mut next = (*self.config.load()).clone();
        next.writers.count = workers;
        self.config.swap(next);
        if let Some(pool) = &self.pool {
            pool.scale(workers);
        }
        Ok(())
    }

    /// Graceful drain, then a hard deadline
    pub async fn shutdown(mut self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        info!("pipeline shutting down");

        if let Some(pool) = self.pool.take() {
            pool.shutdown(deadline).await;
        }

        let _ = self.sweeper_tx.send(SweeperCommand::Shutdown);
        if let Some(sweeper) = self.sweeper.take() {
            if tokio::time::timeout(deadline, sweeper).await.is_err() {
                warn!("sweeper did not stop before the deadline");
            }
        }

        info!("pipeline stopped");
    }
}

/// Periodic maintenance: correlation sweeps and store retention
async fn run_sweeper(
    correlator: Arc<Correlator>,
    store: Arc<EventStore>,
    config: Arc<ConfigCell>,
    sweep_failures: Arc<AtomicU64>,
    mut commands: mpsc::UnboundedReceiver<SweeperCommand>,
) {
    let cfg = config.load();
    let mut sweep_every = cfg.correlation.sweep_interval;
    let mut prune_every = cfg.store.prune_interval;

    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prune = tokio::time::interval(prune_every);
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let orphans: Vec<Arc<CorrelatedEvent>> =
                    correlator.sweep().into_iter().map(Arc::new).collect();
                if !orphans.is_empty() {
                    if let Err(err) = store.write_batch(&orphans) {
                        warn!(%err, count = orphans.len(), "sweep orphan persist failed");
                        sweep_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let cfg = config.load();
                if cfg.correlation.sweep_interval != sweep_every {
                    sweep_every = cfg.correlation.sweep_interval;
                    sweep = tokio::time::interval(sweep_every);
                    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
            }
            _ = prune.tick() => {
                let cfg = config.load();
                let stats = store.stats();

                if let Some(newest) = stats.newest_mono {
                    let cutoff = newest.saturating_sub(cfg.store.retention.as_nanos() as u64);
                    store.prune(cutoff);
                }
                // Count-threshold retention: free headroom once the store
                // reaches capacity so Writers can make progress again
                if stats.records >= cfg.store.max_records {
                    store.enforce_max_records(cfg.store.max_records * 9 / 10);
                }

                if cfg.store.prune_interval != prune_every {
                    prune_every = cfg.store.prune_interval;
                    prune = tokio::time::interval(prune_every);
                    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
            }
            cmd = commands.recv() => match cmd {
                Some(SweeperCommand::Shutdown) | None => break,
            }
        }
    }
}
