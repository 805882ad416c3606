/*!
 * Correlation State
 * Keyed state mutated by exactly one logical pass at a time
 *
 * Each map is sharded by key hash (DashMap), so unrelated processes and
 * signatures correlate fully in parallel while a single key is serialized.
 */

use crate::core::id::{CorrelationId, EventId};
use crate::core::types::{MonoNs, Pid, WallNs};
use crate::events::CanonicalEvent;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Instant;

/// One open call on a process's stack
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub correlation: CorrelationId,
    pub parent: Option<CorrelationId>,
    pub function: Option<String>,
    pub entered_mono: MonoNs,
    /// Local arrival time, used for stale-frame eviction
    pub registered: Instant,
}

/// Pending-message table key: who talked to whom about what
///
/// The fingerprint is a hash of the message content (and the correlation hint
/// when both sides supply one), so identical concurrent messages between the
/// same pair queue up under one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageSignature {
    pub sender: Pid,
    pub receiver: Pid,
    pub fingerprint: u64,
}

impl MessageSignature {
    pub fn of(
        sender: Pid,
        receiver: Pid,
        content: &str,
        hint: Option<u64>,
        hasher: &RandomState,
    ) -> Self {
        let mut fingerprint = hasher.hash_one(content);
        if let Some(hint) = hint {
            fingerprint ^= hasher.hash_one(hint);
        }
        Self {
            sender,
            receiver,
            fingerprint,
        }
    }
}

/// One side of an unmatched message, awaiting its counterpart
#[derive(Debug, Clone)]
pub enum Pending {
    /// Send already emitted; remembers its correlation for the future receive
    Send {
        correlation: CorrelationId,
        event_id: EventId,
        registered: Instant,
    },
    /// Receive held back until a send arrives or the TTL expires
    Receive {
        event: Arc<CanonicalEvent>,
        registered: Instant,
    },
}

impl Pending {
    #[inline]
    pub fn registered(&self) -> Instant {
        match self {
            Self::Send { registered, .. } | Self::Receive { registered, .. } => *registered,
        }
    }
}

/// What a correlation context represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    Call,
    Message,
    Context,
}

/// Correlation metadata: kind, birth, owner, and lifecycle flags
#[derive(Debug, Clone)]
pub struct CorrelationMeta {
    pub kind: CorrelationKind,
    pub created_wall: WallNs,
    pub owner: Pid,
    pub completed: bool,
    pub orphaned: bool,
    /// Local creation time, used for retention sweeping
    pub registered: Instant,
}

impl CorrelationMeta {
    pub fn new(kind: CorrelationKind, owner: Pid, created_wall: WallNs) -> Self {
        Self {
            kind,
            created_wall,
            owner,
            completed: false,
            orphaned: false,
            registered: Instant::now(),
        }
    }
}
