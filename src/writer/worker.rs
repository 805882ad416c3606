/*!
 * Writer Worker
 * One batch-consuming loop: poll, read, correlate, persist, commit
 *
 * Each worker statically owns a disjoint subset of staging shards (shard
 * index modulo worker count), so no event is read by two Writers and none is
 * skipped. The shard cursor is committed only after the store accepts the
 * batch; a crash between read and commit reprocesses that batch at most once.
 */

use crate::buffer::StagingBuffer;
use crate::core::config::ConfigCell;
use crate::core::id::CursorId;
use crate::correlate::Correlator;
use crate::events::CorrelatedEvent;
use crate::store::EventStore;
use crate::writer::pool::WriterPoolStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Shared dependencies handed to every worker
#[derive(Clone)]
pub(crate) struct WriterContext {
    pub shards: Arc<Vec<Arc<StagingBuffer>>>,
    /// One persistent cursor per shard; survives worker restarts
    pub cursors: Arc<Vec<CursorId>>,
    pub correlator: Arc<Correlator>,
    pub store: Arc<EventStore>,
    pub config: Arc<ConfigCell>,
    pub stats: Arc<WriterPoolStats>,
}

/// Control messages for a worker
#[derive(Debug)]
pub(crate) enum WriterCommand {
    Shutdown,
}

/// A correlated batch whose store write has not succeeded yet
///
/// Held by the worker so a transient store failure retries the write without
/// re-running correlation; the cursor stays put until the write lands.
struct PendingBatch {
    shard: usize,
    next_position: u64,
    records: Vec<Arc<CorrelatedEvent>>,
}

/// Exponential backoff between persist retries
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    until: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            until: None,
        }
    }

    fn trip(&mut self) {
        self.until = Some(Instant::now() + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    fn ready(&mut self) -> bool {
        match self.until {
            Some(until) if Instant::now() < until => false,
            _ => {
                self.until = None;
                true
            }
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.until = None;
    }
}

pub(crate) async fn run_writer(
    ctx: WriterContext,
    worker_id: usize,
    worker_count: usize,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let startup = ctx.config.load();
    let mut poll = startup.writers.poll_interval;
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut backoff = Backoff::new(startup.writers.backoff_initial, startup.writers.backoff_max);
    let mut pending: Option<PendingBatch> = None;

    info!(worker_id, worker_count, "writer started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cfg = ctx.config.load();
                if cfg.writers.poll_interval != poll {
                    poll = cfg.writers.poll_interval;
                    interval = tokio::time::interval(poll);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }

                if !backoff.ready() {
                    continue;
                }

                // A failed batch is retried before any new reads; the cursor
                // for its shard has not moved
                if let Some(batch) = pending.take() {
                    match persist(&ctx, batch) {
                        Ok(()) => backoff.reset(),
                        Err(batch) => {
                            pending = Some(batch);
                            backoff.trip();
                            continue;
                        }
                    }
                }

                for shard in (worker_id..ctx.shards.len()).step_by(worker_count.max(1)) {
                    if let Err(batch) = process_shard(&ctx, shard, cfg.writers.batch_size) {
                        pending = Some(batch);
                        backoff.trip();
                        break;
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(WriterCommand::Shutdown) | None => break,
            }
        }
    }

    // Graceful drain: one last attempt at the in-flight batch
    if let Some(batch) = pending.take() {
        if persist(&ctx, batch).is_err() {
            ctx.stats.abandoned_batches.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, "in-flight batch abandoned at shutdown");
        }
    }

    info!(worker_id, "writer stopped");
}

fn process_shard(ctx: &WriterContext, shard: usize, batch_size: usize) -> Result<(), PendingBatch> {
    let buffer = &ctx.shards[shard];
    let cursor = ctx.cursors[shard];

    let batch = match buffer.read_batch(cursor, batch_size) {
        Ok(batch) => batch,
        Err(_) => return Ok(()),
    };
    if batch.is_empty() {
        return Ok(());
    }

    // Correlation completes before persistence, so stored records are always
    // fully correlated at read time
    let correlated = ctx.correlator.correlate(&batch.events);
    let records: Vec<Arc<CorrelatedEvent>> = correlated.into_iter().map(Arc::new).collect();

    persist(
        ctx,
        PendingBatch {
            shard,
            next_position: batch.next_position,
            records,
        },
    )
}

fn persist(ctx: &WriterContext, batch: PendingBatch) -> Result<(), PendingBatch> {
    match ctx.store.write_batch(&batch.records) {
        Ok(committed) => {
            ctx.shards[batch.shard].commit_cursor(ctx.cursors[batch.shard], batch.next_position);
            ctx.stats.batches_processed.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .events_written
                .fetch_add(committed.inserted as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            warn!(shard = batch.shard, %err, "batch persist failed; cursor held for retry");
            ctx.stats.write_failures.fetch_add(1, Ordering::Relaxed);
            Err(batch)
        }
    }
}
