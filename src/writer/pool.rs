/*!
 * Writer Pool Supervision
 * Spawns, restarts, rescales, and drains the Writer workers
 *
 * A crashed worker is logged, counted, and replaced; the replacement resumes
 * from its shards' last committed cursors, so a batch read but not committed
 * before the crash is reprocessed at most once more (accepted duplication,
 * absorbed idempotently by the store).
 */

use crate::writer::worker::{run_writer, WriterCommand, WriterContext};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Shared pool counters, updated by workers and the supervisor
#[derive(Debug, Default)]
pub struct WriterPoolStats {
    pub active: AtomicUsize,
    pub restarts: AtomicU64,
    pub batches_processed: AtomicU64,
    pub events_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub abandoned_batches: AtomicU64,
}

/// Point-in-time view of the pool counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub active: usize,
    pub restarts: u64,
    pub batches_processed: u64,
    pub events_written: u64,
    pub write_failures: u64,
    pub abandoned_batches: u64,
}

impl WriterPoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.active.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            abandoned_batches: self.abandoned_batches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum PoolCommand {
    Scale(usize),
    Shutdown,
}

/// Handle to the supervised pool of Writer workers
pub struct WriterPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    supervisor: Option<JoinHandle<()>>,
    stats: Arc<WriterPoolStats>,
}

impl WriterPool {
    /// Spawn the supervisor and the initial worker generation
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn spawn(ctx: WriterContext) -> Self {
        let worker_count = ctx.config.load().writers.count;
        let stats = Arc::clone(&ctx.stats);
        let (tx, rx) = mpsc::unbounded_channel();

        let supervisor = tokio::spawn(run_supervisor(ctx, worker_count, rx));

        Self {
            commands: tx,
            supervisor: Some(supervisor),
            stats,
        }
    }

    /// Restart the workers with a new count; shard cursors persist, so no
    /// events are lost or double-read across the rescale
    pub fn scale(&self, workers: usize) {
        let _ = self.commands.send(PoolCommand::Scale(workers));
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.stats.snapshot()
    }

    /// Graceful drain, then a hard deadline
    ///
    /// Workers finish their in-flight batch and stop; anything still running
    /// at the deadline is aborted and its work counted as abandoned, never
    /// silently lost.
    pub async fn shutdown(mut self, deadline: Duration) {
        let _ = self.commands.send(PoolCommand::Shutdown);

        if let Some(mut handle) = self.supervisor.take() {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(_) => info!("writer pool drained"),
                Err(_) => {
                    let stranded = self.stats.active.load(Ordering::Relaxed);
                    warn!(stranded, "shutdown deadline exceeded; aborting writers");
                    self.stats
                        .abandoned_batches
                        .fetch_add(stranded as u64, Ordering::Relaxed);
                    // Dropping the supervisor's JoinSet aborts its workers
                    handle.abort();
                }
            }
        }
    }
}

async fn run_supervisor(
    ctx: WriterContext,
    initial_count: usize,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
) {
    let mut tasks: JoinSet<(usize, bool)> = JoinSet::new();
    let mut senders: Vec<mpsc::UnboundedSender<WriterCommand>> = Vec::new();
    let mut worker_count = initial_count;
    let mut shutting_down = false;

    spawn_generation(&ctx, worker_count, &mut tasks, &mut senders);

    loop {
        tokio::select! {
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                match result {
                    Ok((worker_id, panicked)) => {
                        ctx.stats.active.fetch_sub(1, Ordering::Relaxed);
                        if panicked && !shutting_down {
                            error!(worker_id, "writer crashed; spawning replacement");
                            ctx.stats.restarts.fetch_add(1, Ordering::Relaxed);
                            spawn_worker(&ctx, worker_id, worker_count, &mut tasks, &mut senders);
                        }
                    }
                    // catch_unwind wraps every worker, so this is an abort
                    Err(_) => {
                        ctx.stats.active.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                if shutting_down && tasks.is_empty() {
                    break;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(PoolCommand::Scale(count)) if !shutting_down => {
                    info!(from = worker_count, to = count, "rescaling writer pool");
                    for tx in &senders {
                        let _ = tx.send(WriterCommand::Shutdown);
                    }
                    while tasks.join_next().await.is_some() {}
                    ctx.stats.active.store(0, Ordering::Relaxed);
                    senders.clear();

                    worker_count = count;
                    spawn_generation(&ctx, worker_count, &mut tasks, &mut senders);
                }
                Some(PoolCommand::Scale(_)) => {}
                Some(PoolCommand::Shutdown) | None => {
                    shutting_down = true;
                    for tx in &senders {
                        let _ = tx.send(WriterCommand::Shutdown);
                    }
                    if tasks.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    info!("writer pool supervisor stopped");
}

fn spawn_generation(
    ctx: &WriterContext,
    count: usize,
    tasks: &mut JoinSet<(usize, bool)>,
    senders: &mut Vec<mpsc::UnboundedSender<WriterCommand>>,
) {
    senders.resize_with(count, || mpsc::unbounded_channel().0);
    for worker_id in 0..count {
        spawn_worker(ctx, worker_id, count, tasks, senders);
    }
}

fn spawn_worker(
    ctx: &WriterContext,
    worker_id: usize,
    worker_count: usize,
    tasks: &mut JoinSet<(usize, bool)>,
    senders: &mut Vec<mpsc::UnboundedSender<WriterCommand>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    senders[worker_id] = tx;

    let worker = run_writer(ctx.clone(), worker_id, worker_count, rx);
    ctx.stats.active.fetch_add(1, Ordering::Relaxed);
    tasks.spawn(async move {
        let outcome = AssertUnwindSafe(worker).catch_unwind().await;
        (worker_id, outcome.is_err())
    });
}
