/*!
 * Event Model
 * Strongly-typed capture events flowing through the pipeline
 *
 * Three shapes, one per pipeline stage: RawEvent (caller-owned input),
 * CanonicalEvent (normalized, size-bounded, staged), CorrelatedEvent
 * (correlation-tagged, persisted).
 */

use crate::core::id::{CorrelationId, EventId};
use crate::core::types::{MonoNs, Pid, WallNs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// What kind of execution event was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventKind {
    CallEnter,
    CallExit,
    MessageSend,
    MessageReceive,
    StateChange,
    Custom,
}

/// Event payload - tagged union over known event shapes
///
/// The `Opaque` variant carries extension payloads without reintroducing
/// untyped dispatch; `Truncated` replaces oversized content while preserving
/// a type hint and the original size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Call {
        function: String,
        arguments: String,
    },
    Return {
        function: String,
        result: String,
    },
    Message {
        sender: Pid,
        receiver: Pid,
        content: String,
    },
    Transition {
        entity: String,
        from: String,
        to: String,
    },
    Opaque {
        type_hint: String,
        bytes: Vec<u8>,
    },
    Truncated {
        type_hint: String,
        original_size: usize,
    },
}

impl Payload {
    /// Short type tag preserved across truncation
    pub fn type_hint(&self) -> &str {
        match self {
            Self::Call { .. } => "call",
            Self::Return { .. } => "return",
            Self::Message { .. } => "message",
            Self::Transition { .. } => "transition",
            Self::Opaque { type_hint, .. } => type_hint,
            Self::Truncated { type_hint, .. } => type_hint,
        }
    }

    /// Approximate in-memory payload size, used for the truncation bound
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Call {
                function,
                arguments,
            } => function.len() + arguments.len(),
            Self::Return { function, result } => function.len() + result.len(),
            Self::Message { content, .. } => content.len() + 16,
            Self::Transition { entity, from, to } => entity.len() + from.len() + to.len(),
            Self::Opaque { type_hint, bytes } => type_hint.len() + bytes.len(),
            Self::Truncated { type_hint, .. } => type_hint.len() + 8,
        }
    }

    /// Function identity, for call events and the function index
    pub fn function(&self) -> Option<&str> {
        match self {
            Self::Call { function, .. } | Self::Return { function, .. } => Some(function),
            _ => None,
        }
    }

    /// Marker that replaces this payload when it exceeds the size bound
    pub fn truncation_marker(&self) -> Payload {
        Payload::Truncated {
            type_hint: self.type_hint().to_string(),
            original_size: self.approx_size(),
        }
    }
}

/// Caller-supplied capture event, owned by the caller until ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    pub payload: Payload,
    pub pid: Pid,
    /// Optional caller-chosen key binding this event to a shared correlation
    /// context (e.g. a request ID known to the instrumentation layer)
    pub correlation_hint: Option<u64>,
    /// Zero means "stamp at ingestion"
    pub mono_ns: MonoNs,
    /// Zero means "stamp at ingestion"
    pub wall_ns: WallNs,
}

impl RawEvent {
    pub fn new(kind: EventKind, pid: Pid, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            pid,
            correlation_hint: None,
            mono_ns: 0,
            wall_ns: 0,
        }
    }

    pub fn call_enter(pid: Pid, function: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::new(
            EventKind::CallEnter,
            pid,
            Payload::Call {
                function: function.into(),
                arguments: arguments.into(),
            },
        )
    }

    pub fn call_exit(pid: Pid, function: impl Into<String>, result: impl Into<String>) -> Self {
        Self::new(
            EventKind::CallExit,
            pid,
            Payload::Return {
                function: function.into(),
                result: result.into(),
            },
        )
    }

    pub fn message_send(sender: Pid, receiver: Pid, content: impl Into<String>) -> Self {
        Self::new(
            EventKind::MessageSend,
            sender,
            Payload::Message {
                sender,
                receiver,
                content: content.into(),
            },
        )
    }

    pub fn message_receive(sender: Pid, receiver: Pid, content: impl Into<String>) -> Self {
        Self::new(
            EventKind::MessageReceive,
            receiver,
            Payload::Message {
                sender,
                receiver,
                content: content.into(),
            },
        )
    }

    pub fn state_change(
        pid: Pid,
        entity: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(
            EventKind::StateChange,
            pid,
            Payload::Transition {
                entity: entity.into(),
                from: from.into(),
                to: to.into(),
            },
        )
    }

    #[inline]
    pub fn with_hint(mut self, hint: u64) -> Self {
        self.correlation_hint = Some(hint);
        self
    }

    #[inline]
    pub fn at(mut self, mono_ns: MonoNs, wall_ns: WallNs) -> Self {
        self.mono_ns = mono_ns;
        self.wall_ns = wall_ns;
        self
    }
}

/// Normalized, timestamped, size-bounded event record
///
/// Immutable once created; owned by the staging slot it occupies until read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub pid: Pid,
    pub correlation_hint: Option<u64>,
    pub mono_ns: MonoNs,
    pub wall_ns: WallNs,
    pub payload: Payload,
}

impl CanonicalEvent {
    #[inline]
    pub fn function(&self) -> Option<&str> {
        self.payload.function()
    }
}

/// Kind of recorded relationship between two correlation IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// The linked correlation is this record's parent call
    Parent,
    /// The linked correlation is a child call spawned under this one
    Child,
    /// The linked correlation is the other half of a send/receive pair
    MessagePair,
    /// The linked correlation was bound through a caller-supplied hint
    Hint,
}

/// A recorded causal relationship to another correlation ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalLink {
    pub other: CorrelationId,
    pub kind: LinkKind,
}

/// Canonical event plus its correlation outcome; the only shape the store
/// accepts, so no record is persisted without an outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatedEvent {
    pub event: Arc<CanonicalEvent>,
    pub correlation_id: CorrelationId,
    pub parent_id: Option<CorrelationId>,
    pub links: Vec<CausalLink>,
    /// No matching counterpart was found (empty-stack exit, expired message)
    pub orphan: bool,
    /// Call duration, attached to exit records
    pub duration_ns: Option<u64>,
}

impl CorrelatedEvent {
    #[inline]
    pub fn id(&self) -> EventId {
        self.event.id
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.event.pid
    }

    #[inline]
    pub fn mono_ns(&self) -> MonoNs {
        self.event.mono_ns
    }
}

/// Current monotonic time in nanoseconds, relative to first use
#[inline]
pub fn now_mono_ns() -> MonoNs {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Current wall-clock time in nanoseconds since the Unix epoch
#[inline]
pub fn now_wall_ns() -> WallNs {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
