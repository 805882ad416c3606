/*!
 * Event Store
 * Indexed, append-mostly in-memory store for correlated records
 *
 * One primary table plus secondary indexes by time, process, function, and
 * correlation ID. Batch writes commit all-or-nothing from the caller's
 * perspective; queries run read-only against structures that are safe for
 * concurrent readers during writes (snapshot-style consistency, not a
 * point-in-time transaction).
 */

pub mod query;

pub use query::{Order, QueryOptions, TimeRange};

use crate::core::config::ConfigCell;
use crate::core::errors::StoreError;
use crate::core::id::{CorrelationId, EventId};
use crate::core::shard::{ShardPlan, WorkloadProfile};
use crate::core::types::{MonoNs, Pid};
use crate::events::CorrelatedEvent;
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Successful batch commit summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub inserted: usize,
    /// Redelivered event IDs absorbed idempotently (crash reprocessing)
    pub duplicates: usize,
}

/// Store statistics, O(1) from running aggregates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: usize,
    pub total_written: u64,
    pub duplicates: u64,
    pub pruned: u64,
    pub oldest_mono: Option<MonoNs>,
    pub newest_mono: Option<MonoNs>,
}

/// Indexed in-memory event store
pub struct EventStore {
    records: DashMap<EventId, Arc<CorrelatedEvent>, RandomState>,
    by_time: RwLock<BTreeSet<(MonoNs, EventId)>>,
    by_process: DashMap<Pid, BTreeSet<(MonoNs, EventId)>, RandomState>,
    by_function: DashMap<String, BTreeSet<(MonoNs, EventId)>, RandomState>,
    by_correlation: DashMap<CorrelationId, Vec<EventId>, RandomState>,

    config: Arc<ConfigCell>,

    count: AtomicUsize,
    total_written: AtomicU64,
    duplicates: AtomicU64,
    pruned: AtomicU64,
    oldest: AtomicU64,
    newest: AtomicU64,
}

impl EventStore {
    pub fn new(config: Arc<ConfigCell>) -> Self {
        let warm = ShardPlan::shards(WorkloadProfile::MediumContention);
        Self {
            records: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            by_time: RwLock::new(BTreeSet::new()),
            by_process: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            by_function: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            by_correlation: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            config,
            count: AtomicUsize::new(0),
            total_written: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            oldest: AtomicU64::new(u64::MAX),
            newest: AtomicU64::new(0),
        }
    }

    /// Insert a batch into the primary table and every secondary index
    ///
    /// The capacity check runs up front so a failing batch commits nothing;
    /// the caller retries the whole batch after pruning frees space. The
    /// bound is soft under concurrent writers (two pre-checks may interleave),
    /// which trades a few records of overshoot for a lock-free hot path.
    pub fn write_batch(&self, batch: &[Arc<CorrelatedEvent>]) -> Result<Committed, StoreError> {
        if batch.is_empty() {
            return Ok(Committed {
                inserted: 0,
                duplicates: 0,
            });
        }

        let max_records = self.config.load().store.max_records;
        let fresh = batch
            .iter()
            .filter(|r| !self.records.contains_key(&r.id()))
            .count();
        let available = max_records.saturating_sub(self.count.load(Ordering::Acquire));
        if fresh > available {
            return Err(StoreError::CapacityExhausted {
                requested: fresh,
                available,
            });
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        let mut time_entries = Vec::with_capacity(batch.len());

        for record in batch {
            let id = record.id();
            if self.records.insert(id, Arc::clone(record)).is_some() {
                // Same event delivered twice across a crash boundary; the
                // indexes already carry its keys
                duplicates += 1;
                continue;
            }

            let mono = record.mono_ns();
            time_entries.push((mono, id));
            self.by_process
                .entry(record.pid())
                .or_default()
                .insert((mono, id));
            if let Some(function) = record.event.function() {
                self.by_function
                    .entry(function.to_string())
                    .or_default()
                    .insert((mono, id));
            }
            self.by_correlation
                .entry(record.correlation_id)
                .or_default()
                .push(id);

            self.oldest.fetch_min(mono, Ordering::AcqRel);
            self.newest.fetch_max(mono, Ordering::AcqRel);
            inserted += 1;
        }

        if !time_entries.is_empty() {
            self.by_time.write().extend(time_entries);
        }

        self.count.fetch_add(inserted, Ordering::AcqRel);
        self.total_written.fetch_add(inserted as u64, Ordering::Relaxed);
        self.duplicates.fetch_add(duplicates as u64, Ordering::Relaxed);

        Ok(Committed {
            inserted,
            duplicates,
        })
    }

    /// Records with `start <= mono_ns < end`
    pub fn query_by_time(&self, range: TimeRange, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        let index = self.by_time.read();
        let ids = Self::collect_range(&index, range, opts);
        drop(index);
        self.resolve(ids)
    }

    /// Records from one originating process
    pub fn query_by_process(&self, pid: Pid, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        let range = opts.range.unwrap_or_else(TimeRange::all);
        let ids = match self.by_process.get(&pid) {
            Some(index) => Self::collect_range(index.value(), range, opts),
            None => Vec::new(),
        };
        self.resolve(ids)
    }

    /// Records for one function identity
    pub fn query_by_function(&self, function: &str, opts: &QueryOptions) -> Vec<Arc<CorrelatedEvent>> {
        let range = opts.range.unwrap_or_else(TimeRange::all);
        let ids = match self.by_function.get(function) {
            Some(index) => Self::collect_range(index.value(), range, opts),
            None => Vec::new(),
        };
        self.resolve(ids)
    }

    /// Records sharing one correlation ID
    pub fn query_by_correlation(
        &self,
        correlation: CorrelationId,
        opts: &QueryOptions,
    ) -> Vec<Arc<CorrelatedEvent>> {
        let ids = match self.by_correlation.get(&correlation) {
            Some(entry) => entry.value().clone(),
            None => Vec::new(),
        };

        let mut records: Vec<Arc<CorrelatedEvent>> = ids
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| Arc::clone(r.value())))
            .filter(|r| opts.range.map_or(true, |range| range.contains(r.mono_ns())))
            .collect();

        records.sort_by_key(|r| (r.mono_ns(), r.id()));
        if opts.order == Order::Descending {
            records.reverse();
        }
        if let Some(limit) = opts.limit {
            records.truncate(limit);
        }
        records
    }

    /// Running aggregates, O(1)
    pub fn stats(&self) -> StoreStats {
        let records = self.count.load(Ordering::Acquire);
        let oldest = self.oldest.load(Ordering::Acquire);
        let newest = self.newest.load(Ordering::Acquire);
        StoreStats {
            records,
            total_written: self.total_written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            oldest_mono: (records > 0 && oldest != u64::MAX).then_some(oldest),
            newest_mono: (records > 0).then_some(newest),
        }
    }

    /// Remove records with `mono_ns < cutoff` from the table and all indexes
    pub fn prune(&self, cutoff: MonoNs) -> usize {
        let victims: Vec<(MonoNs, EventId)> = {
            let index = self.by_time.read();
            index
                .range(..(cutoff, EventId(0)))
                .copied()
                .collect()
        };
        self.remove_entries(victims)
    }

    /// Prune oldest-first until at most `max` records remain
    pub fn enforce_max_records(&self, max: usize) -> usize {
        let excess = self.count.load(Ordering::Acquire).saturating_sub(max);
        if excess == 0 {
            return 0;
        }
        let victims: Vec<(MonoNs, EventId)> = {
            let index = self.by_time.read();
            index.iter().take(excess).copied().collect()
        };
        self.remove_entries(victims)
    }

    fn remove_entries(&self, victims: Vec<(MonoNs, EventId)>) -> usize {
        if victims.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for &(mono, id) in &victims {
            let Some((_, record)) = self.records.remove(&id) else {
                continue;
            };

            if let Some(mut index) = self.by_process.get_mut(&record.pid()) {
                index.remove(&(mono, id));
            }
            if let Some(function) = record.event.function() {
                if let Some(mut index) = self.by_function.get_mut(function) {
                    index.remove(&(mono, id));
                }
            }
            if let Some(mut ids) = self.by_correlation.get_mut(&record.correlation_id) {
                ids.retain(|other| *other != id);
            }
            removed += 1;
        }

        {
            let mut index = self.by_time.write();
            for entry in &victims {
                index.remove(entry);
            }
            // Refresh the oldest-timestamp aggregate under the same lock
            match index.iter().next() {
                Some(&(mono, _)) => self.oldest.store(mono, Ordering::Release),
                None => self.oldest.store(u64::MAX, Ordering::Release),
            }
        }

        self.count.fetch_sub(removed, Ordering::AcqRel);
        self.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(removed, "store pruned");
        removed
    }

    fn collect_range(
        index: &BTreeSet<(MonoNs, EventId)>,
        range: TimeRange,
        opts: &QueryOptions,
    ) -> Vec<EventId> {
        let effective = match opts.range {
            Some(extra) => TimeRange::new(range.start.max(extra.start), range.end.min(extra.end)),
            None => range,
        };
        if effective.start >= effective.end {
            return Vec::new();
        }

        let span = index.range((effective.start, EventId(0))..(effective.end, EventId(0)));
        let mut ids: Vec<EventId> = span.map(|&(_, id)| id).collect();
        if opts.order == Order::Descending {
            ids.reverse();
        }
        if let Some(limit) = opts.limit {
            ids.truncate(limit);
        }
        ids
    }

    fn resolve(&self, ids: Vec<EventId>) -> Vec<Arc<CorrelatedEvent>> {
        ids.into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| Arc::clone(r.value())))
            .collect()
    }
}
