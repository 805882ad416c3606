/*!
 * Correlator
 * Stateful reconstruction of call trees and message pairs
 *
 * `correlate` never fails: the worst outcome for any event is an
 * orphan-flagged record. State is sharded by process / signature hash, so
 * unrelated keys proceed fully in parallel while one key is serialized.
 */

use crate::core::config::ConfigCell;
use crate::core::id::{CorrelationId, CorrelationIdGenerator};
use crate::core::shard::{ShardPlan, WorkloadProfile};
use crate::core::types::Pid;
use crate::events::{CanonicalEvent, CausalLink, CorrelatedEvent, EventKind, LinkKind, Payload};
use crate::correlate::state::{
    CallFrame, CorrelationKind, CorrelationMeta, MessageSignature, Pending,
};
use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Correlation statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationStats {
    pub matched: u64,
    pub orphaned: u64,
    pub swept: u64,
    /// Unresolved state awaiting counterparts: pending messages + open calls
    pub backlog: usize,
    pub pending_messages: usize,
    pub open_calls: usize,
    pub tracked_correlations: usize,
}

/// Causal correlation engine
pub struct Correlator {
    /// Per-process stacks of open calls
    stacks: DashMap<Pid, Vec<CallFrame>, RandomState>,
    /// Unmatched message halves keyed by signature
    pending: DashMap<MessageSignature, VecDeque<Pending>, RandomState>,
    /// Correlation ID -> kind, birth, owner, lifecycle
    meta: DashMap<CorrelationId, CorrelationMeta, RandomState>,
    /// Correlation ID -> related IDs and link kinds (multi-valued)
    links: DashMap<CorrelationId, Vec<CausalLink>, RandomState>,
    /// Caller-supplied hint -> bound correlation context
    hints: DashMap<u64, CorrelationId, RandomState>,

    ids: CorrelationIdGenerator,
    fingerprint: RandomState,
    config: Arc<ConfigCell>,

    matched: AtomicU64,
    orphaned: AtomicU64,
    swept: AtomicU64,
}

impl Correlator {
    pub fn new(config: Arc<ConfigCell>) -> Self {
        let hot = ShardPlan::shards(WorkloadProfile::HighContention);
        let warm = ShardPlan::shards(WorkloadProfile::MediumContention);
        let cold = ShardPlan::shards(WorkloadProfile::LowContention);

        Self {
            stacks: DashMap::with_hasher_and_shard_amount(RandomState::new(), hot),
            pending: DashMap::with_hasher_and_shard_amount(RandomState::new(), hot),
            meta: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            links: DashMap::with_hasher_and_shard_amount(RandomState::new(), warm),
            hints: DashMap::with_hasher_and_shard_amount(RandomState::new(), cold),
            ids: CorrelationIdGenerator::new(),
            fingerprint: RandomState::new(),
            config,
            matched: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Correlate one batch; output need not be 1:1 with input
    ///
    /// A Receive with no matching Send is held pending and emitted later (on
    /// match or on TTL sweep); a Send that finds a waiting Receive emits both
    /// halves at once.
    pub fn correlate(&self, batch: &[Arc<CanonicalEvent>]) -> Vec<CorrelatedEvent> {
        let mut out = Vec::with_capacity(batch.len());
        for event in batch {
            match event.kind {
                EventKind::CallEnter => out.push(self.on_call_enter(event)),
                EventKind::CallExit => out.push(self.on_call_exit(event)),
                EventKind::MessageSend => self.on_send(event, &mut out),
                EventKind::MessageReceive => self.on_receive(event, &mut out),
                EventKind::StateChange | EventKind::Custom => out.push(self.on_context(event)),
            }
        }
        out
    }

    fn on_call_enter(&self, event: &Arc<CanonicalEvent>) -> CorrelatedEvent {
        let cid = self.ids.next();
        let parent = {
            let mut frames = self.stacks.entry(event.pid).or_default();
            let parent = frames.last().map(|f| f.correlation);
            frames.push(CallFrame {
                correlation: cid,
                parent,
                function: event.function().map(str::to_string),
                entered_mono: event.mono_ns,
                registered: Instant::now(),
            });
            parent
        };

        self.meta.insert(
            cid,
            CorrelationMeta::new(CorrelationKind::Call, event.pid, event.wall_ns),
        );

        let mut links = Vec::new();
        if let Some(parent) = parent {
            self.add_link(parent, cid, LinkKind::Child);
            self.add_link(cid, parent, LinkKind::Parent);
            links.push(CausalLink {
                other: parent,
                kind: LinkKind::Parent,
            });
        }
        if let Some(hint) = event.correlation_hint {
            let bound = self.bind_hint(hint, cid);
            if bound != cid {
                self.add_link(cid, bound, LinkKind::Hint);
                links.push(CausalLink {
                    other: bound,
                    kind: LinkKind::Hint,
                });
            }
        }

        CorrelatedEvent {
            event: Arc::clone(event),
            correlation_id: cid,
            parent_id: parent,
            links,
            orphan: false,
            duration_ns: None,
        }
    }

    fn on_call_exit(&self, event: &Arc<CanonicalEvent>) -> CorrelatedEvent {
        let popped = match self.stacks.get_mut(&event.pid) {
            Some(mut frames) => {
                let matches = frames.last().map_or(false, |top| {
                    match (top.function.as_deref(), event.function()) {
                        (Some(open), Some(exit)) => open == exit,
                        // Either side anonymous: trust stack discipline
                        _ => true,
                    }
                });
                if matches {
                    frames.pop()
                } else {
                    None
                }
            }
            None => None,
        };

        match popped {
            Some(frame) => {
                self.matched.fetch_add(1, Ordering::Relaxed);
                if let Some(mut meta) = self.meta.get_mut(&frame.correlation) {
                    meta.completed = true;
                }
                CorrelatedEvent {
                    event: Arc::clone(event),
                    correlation_id: frame.correlation,
                    parent_id: frame.parent,
                    links: self.snapshot_links(frame.correlation),
                    orphan: false,
                    duration_ns: Some(event.mono_ns.saturating_sub(frame.entered_mono)),
                }
            }
            None => {
                debug!(pid = event.pid, "exit without matching entry");
                self.orphan_record(event)
            }
        }
    }

    fn on_send(&self, event: &Arc<CanonicalEvent>, out: &mut Vec<CorrelatedEvent>) {
        let Payload::Message {
            sender,
            receiver,
            content,
        } = &event.payload
        else {
            // Truncated or foreign payload: the content fingerprint is gone,
            // so pairing is impossible; correlate as a standalone context
            out.push(self.on_context(event));
            return;
        };

        let signature = MessageSignature::of(
            *sender,
            *receiver,
            content,
            event.correlation_hint,
            &self.fingerprint,
        );

        let mut queue = self.pending.entry(signature).or_default();
        let waiting = match queue.front() {
            Some(Pending::Receive { .. }) => queue.pop_front(),
            _ => None,
        };

        if let Some(Pending::Receive {
            event: recv_event, ..
        }) = waiting
        {
            drop(queue);
            let send_cid = self.ids.next();
            let recv_cid = self.ids.next();
            self.meta.insert(
                send_cid,
                CorrelationMeta::new(CorrelationKind::Message, event.pid, event.wall_ns),
            );
            self.meta.insert(
                recv_cid,
                CorrelationMeta::new(CorrelationKind::Message, recv_event.pid, recv_event.wall_ns),
            );
            self.add_link(send_cid, recv_cid, LinkKind::MessagePair);
            self.add_link(recv_cid, send_cid, LinkKind::MessagePair);
            self.matched.fetch_add(1, Ordering::Relaxed);

            out.push(CorrelatedEvent {
                event: Arc::clone(event),
                correlation_id: send_cid,
                parent_id: None,
                links: vec![CausalLink {
                    other: recv_cid,
                    kind: LinkKind::MessagePair,
                }],
                orphan: false,
                duration_ns: None,
            });
            out.push(CorrelatedEvent {
                event: recv_event,
                correlation_id: recv_cid,
                parent_id: None,
                links: vec![CausalLink {
                    other: send_cid,
                    kind: LinkKind::MessagePair,
                }],
                orphan: false,
                duration_ns: None,
            });
            return;
        }

        // No waiting receive: register and emit the send straight away
        let cid = self.ids.next();
        queue.push_back(Pending::Send {
            correlation: cid,
            event_id: event.id,
            registered: Instant::now(),
        });
        drop(queue);

        self.meta.insert(
            cid,
            CorrelationMeta::new(CorrelationKind::Message, event.pid, event.wall_ns),
        );
        out.push(CorrelatedEvent {
            event: Arc::clone(event),
            correlation_id: cid,
            parent_id: None,
            links: Vec::new(),
            orphan: false,
            duration_ns: None,
        });
    }

    fn on_receive(&self, event: &Arc<CanonicalEvent>, out: &mut Vec<CorrelatedEvent>) {
        let Payload::Message {
            sender,
            receiver,
            content,
        } = &event.payload
        else {
            out.push(self.on_context(event));
            return;
        };

        let signature = MessageSignature::of(
            *sender,
            *receiver,
            content,
            event.correlation_hint,
            &self.fingerprint,
        );

        let mut queue = self.pending.entry(signature).or_default();
        let waiting = match queue.front() {
            Some(Pending::Send { .. }) => queue.pop_front(),
            _ => None,
        };

        if let Some(Pending::Send {
            correlation: send_cid,
            ..
        }) = waiting
        {
            drop(queue);
            let recv_cid = self.ids.next();
            self.meta.insert(
                recv_cid,
                CorrelationMeta::new(CorrelationKind::Message, event.pid, event.wall_ns),
            );
            if let Some(mut meta) = self.meta.get_mut(&send_cid) {
                meta.completed = true;
            }
            self.add_link(send_cid, recv_cid, LinkKind::MessagePair);
            self.add_link(recv_cid, send_cid, LinkKind::MessagePair);
            self.matched.fetch_add(1, Ordering::Relaxed);

            out.push(CorrelatedEvent {
                event: Arc::clone(event),
                correlation_id: recv_cid,
                parent_id: None,
                links: vec![CausalLink {
                    other: send_cid,
                    kind: LinkKind::MessagePair,
                }],
                orphan: false,
                duration_ns: None,
            });
            return;
        }

        // No send yet: hold the receive until one arrives or the TTL expires
        queue.push_back(Pending::Receive {
            event: Arc::clone(event),
            registered: Instant::now(),
        });
    }

    /// StateChange/Custom events join their enclosing correlation context
    fn on_context(&self, event: &Arc<CanonicalEvent>) -> CorrelatedEvent {
        let enclosing = self
            .stacks
            .get(&event.pid)
            .and_then(|frames| frames.last().map(|f| (f.correlation, f.parent)));

        if let Some((cid, parent)) = enclosing {
            let mut links = Vec::new();
            if let Some(hint) = event.correlation_hint {
                let bound = self.bind_hint(hint, cid);
                if bound != cid {
                    self.add_link(cid, bound, LinkKind::Hint);
                    links.push(CausalLink {
                        other: bound,
                        kind: LinkKind::Hint,
                    });
                }
            }
            return CorrelatedEvent {
                event: Arc::clone(event),
                correlation_id: cid,
                parent_id: parent,
                links,
                orphan: false,
                duration_ns: None,
            };
        }

        if let Some(hint) = event.correlation_hint {
            let mut created = false;
            let cid = *self.hints.entry(hint).or_insert_with(|| {
                created = true;
                self.ids.next()
            });
            if created {
                self.meta.insert(
                    cid,
                    CorrelationMeta::new(CorrelationKind::Context, event.pid, event.wall_ns),
                );
            }
            return CorrelatedEvent {
                event: Arc::clone(event),
                correlation_id: cid,
                parent_id: None,
                links: Vec::new(),
                orphan: false,
                duration_ns: None,
            };
        }

        let cid = self.ids.next();
        self.meta.insert(
            cid,
            CorrelationMeta::new(CorrelationKind::Context, event.pid, event.wall_ns),
        );
        CorrelatedEvent {
            event: Arc::clone(event),
            correlation_id: cid,
            parent_id: None,
            links: Vec::new(),
            orphan: false,
            duration_ns: None,
        }
    }

    /// Evict stale state; returns newly orphaned records for persistence
    ///
    /// Pending messages past the TTL surface as orphans (expired Receives as
    /// explicit records, expired Sends as metadata flags - the Send record was
    /// already stored). Frames, metadata, links, and hint bindings past the
    /// retention window are removed, bounding memory under any traffic shape.
    pub fn sweep(&self) -> Vec<CorrelatedEvent> {
        let cfg = self.config.load();
        let ttl = cfg.correlation.pending_ttl;
        let retention = cfg.correlation.retention;

        let mut orphans = Vec::new();

        self.pending.retain(|_signature, queue| {
            while queue
                .front()
                .map_or(false, |p| p.registered().elapsed() > ttl)
            {
                match queue.pop_front() {
                    Some(Pending::Receive { event, .. }) => {
                        orphans.push(self.orphan_record(&event));
                    }
                    Some(Pending::Send { correlation, .. }) => {
                        if let Some(mut meta) = self.meta.get_mut(&correlation) {
                            meta.orphaned = true;
                        }
                        self.orphaned.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
            !queue.is_empty()
        });

        self.stacks.retain(|_pid, frames| {
            frames.retain(|frame| {
                if frame.registered.elapsed() > retention {
                    if let Some(mut meta) = self.meta.get_mut(&frame.correlation) {
                        meta.orphaned = true;
                    }
                    self.orphaned.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            });
            !frames.is_empty()
        });

        self.meta.retain(|cid, meta| {
            if meta.registered.elapsed() > retention {
                self.links.remove(cid);
                self.swept.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
        self.hints.retain(|_hint, cid| self.meta.contains_key(cid));

        if !orphans.is_empty() {
            debug!(count = orphans.len(), "sweep surfaced pending orphans");
        }
        orphans
    }

    /// Unresolved state awaiting counterparts
    pub fn backlog(&self) -> usize {
        let pending: usize = self.pending.iter().map(|e| e.value().len()).sum();
        let frames: usize = self.stacks.iter().map(|e| e.value().len()).sum();
        pending + frames
    }

    pub fn stats(&self) -> CorrelationStats {
        let pending_messages: usize = self.pending.iter().map(|e| e.value().len()).sum();
        let open_calls: usize = self.stacks.iter().map(|e| e.value().len()).sum();
        CorrelationStats {
            matched: self.matched.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            backlog: pending_messages + open_calls,
            pending_messages,
            open_calls,
            tracked_correlations: self.meta.len(),
        }
    }

    fn orphan_record(&self, event: &Arc<CanonicalEvent>) -> CorrelatedEvent {
        let cid = self.ids.next();
        let kind = match event.kind {
            EventKind::CallEnter | EventKind::CallExit => CorrelationKind::Call,
            EventKind::MessageSend | EventKind::MessageReceive => CorrelationKind::Message,
            _ => CorrelationKind::Context,
        };
        let mut meta = CorrelationMeta::new(kind, event.pid, event.wall_ns);
        meta.orphaned = true;
        self.meta.insert(cid, meta);
        self.orphaned.fetch_add(1, Ordering::Relaxed);

        CorrelatedEvent {
            event: Arc::clone(event),
            correlation_id: cid,
            parent_id: None,
            links: Vec::new(),
            orphan: true,
            duration_ns: None,
        }
    }

    fn snapshot_links(&self, cid: CorrelationId) -> Vec<CausalLink> {
        self.links
            .get(&cid)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn add_link(&self, from: CorrelationId, to: CorrelationId, kind: LinkKind) {
        self.links
            .entry(from)
            .or_default()
            .push(CausalLink { other: to, kind });
    }

    fn bind_hint(&self, hint: u64, cid: CorrelationId) -> CorrelationId {
        *self.hints.entry(hint).or_insert(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use crate::events::RawEvent;

    fn correlator() -> Correlator {
        Correlator::new(Arc::new(ConfigCell::new(PipelineConfig::default())))
    }

    fn canonical(raw: RawEvent, mono: u64) -> Arc<CanonicalEvent> {
        Arc::new(CanonicalEvent {
            id: crate::core::id::EventId(mono),
            kind: raw.kind,
            pid: raw.pid,
            correlation_hint: raw.correlation_hint,
            mono_ns: mono,
            wall_ns: mono,
            payload: raw.payload,
        })
    }

    #[test]
    fn test_nested_call_tree() {
        let correlator = correlator();
        let batch = vec![
            canonical(RawEvent::call_enter(1, "outer", ""), 100),
            canonical(RawEvent::call_enter(1, "inner", ""), 200),
            canonical(RawEvent::call_exit(1, "inner", ""), 300),
            canonical(RawEvent::call_exit(1, "outer", ""), 500),
        ];
        let out = correlator.correlate(&batch);
        assert_eq!(out.len(), 4);

        let outer_enter = &out[0];
        let inner_enter = &out[1];
        let inner_exit = &out[2];
        let outer_exit = &out[3];

        assert_eq!(outer_enter.parent_id, None);
        assert_eq!(inner_enter.parent_id, Some(outer_enter.correlation_id));
        assert_eq!(inner_exit.correlation_id, inner_enter.correlation_id);
        assert_eq!(outer_exit.correlation_id, outer_enter.correlation_id);
        assert_eq!(inner_exit.duration_ns, Some(100));
        assert_eq!(outer_exit.duration_ns, Some(400));
        assert!(outer_exit.duration_ns >= inner_exit.duration_ns);
    }

    #[test]
    fn test_exit_without_entry_is_orphan() {
        let correlator = correlator();
        let out = correlator.correlate(&[canonical(RawEvent::call_exit(1, "ghost", ""), 10)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].orphan);
        assert_eq!(correlator.stats().orphaned, 1);
    }

    #[test]
    fn test_send_then_receive_pairs() {
        let correlator = correlator();
        let send = canonical(RawEvent::message_send(1, 2, "ping"), 10);
        let recv = canonical(RawEvent::message_receive(1, 2, "ping"), 20);

        let first = correlator.correlate(&[send]);
        assert_eq!(first.len(), 1);
        let send_cid = first[0].correlation_id;

        let second = correlator.correlate(&[recv]);
        assert_eq!(second.len(), 1);
        assert!(!second[0].orphan);
        assert!(second[0]
            .links
            .iter()
            .any(|l| l.other == send_cid && l.kind == LinkKind::MessagePair));
        assert_eq!(correlator.stats().matched, 1);
    }

    #[test]
    fn test_receive_before_send_held_then_paired() {
        let correlator = correlator();
        let recv = canonical(RawEvent::message_receive(1, 2, "ping"), 10);
        let send = canonical(RawEvent::message_send(1, 2, "ping"), 20);

        // The early receive is held, not emitted
        let first = correlator.correlate(&[recv]);
        assert!(first.is_empty());
        assert_eq!(correlator.backlog(), 1);

        // The send releases both halves at once
        let second = correlator.correlate(&[send]);
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|r| !r.orphan));
        let send_rec = &second[0];
        let recv_rec = &second[1];
        assert!(send_rec
            .links
            .iter()
            .any(|l| l.other == recv_rec.correlation_id));
        assert_eq!(correlator.backlog(), 0);
    }

    #[test]
    fn test_sweep_orphans_expired_receive() {
        let mut config = PipelineConfig::default();
        config.correlation.pending_ttl = std::time::Duration::from_millis(1);
        let correlator = Correlator::new(Arc::new(ConfigCell::new(config)));

        correlator.correlate(&[canonical(RawEvent::message_receive(1, 2, "lost"), 10)]);
        std::thread::sleep(std::time::Duration::from_millis(5));

        let orphans = correlator.sweep();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].orphan);
        assert_eq!(correlator.backlog(), 0);
    }

    #[test]
    fn test_context_event_joins_enclosing_call() {
        let correlator = correlator();
        let out = correlator.correlate(&[
            canonical(RawEvent::call_enter(1, "handler", ""), 10),
            canonical(RawEvent::state_change(1, "conn", "idle", "busy"), 20),
        ]);
        assert_eq!(out[1].correlation_id, out[0].correlation_id);
    }

    #[test]
    fn test_hint_binds_context_across_processes() {
        let correlator = correlator();
        let out = correlator.correlate(&[
            canonical(RawEvent::state_change(1, "req", "new", "routed").with_hint(7), 10),
            canonical(RawEvent::state_change(2, "req", "routed", "done").with_hint(7), 20),
        ]);
        assert_eq!(out[0].correlation_id, out[1].correlation_id);
    }

    #[test]
    fn test_retention_sweeps_metadata() {
        let mut config = PipelineConfig::default();
        config.correlation.retention = std::time::Duration::from_millis(1);
        config.correlation.pending_ttl = std::time::Duration::from_millis(1);
        let correlator = Correlator::new(Arc::new(ConfigCell::new(config)));

        correlator.correlate(&[
            canonical(RawEvent::call_enter(1, "f", ""), 10),
            canonical(RawEvent::call_exit(1, "f", ""), 20),
        ]);
        assert_eq!(correlator.stats().tracked_correlations, 1);

        std::thread::sleep(std::time::Duration::from_millis(5));
        correlator.sweep();
        assert_eq!(correlator.stats().tracked_correlations, 0);
    }
}
