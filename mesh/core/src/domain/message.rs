// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # KLP Message Model
//!
//! Domain types for the Kind Link Protocol envelope. A [`KlpMessage`] carries
//! a [`MessagePayload`] — a tagged union with one fixed shape per
//! [`MessageKind`] — between two agents, signed over the canonical byte
//! serialization produced by [`crate::infrastructure::codec`].
//!
//! ## Invariants
//!
//! - A message is routable only if its signature verifies against the
//!   sender's registered public key for the exact canonical bytes of its
//!   fields ([`MessageAuthenticator`]).
//! - Unknown *extension* entries are preserved verbatim and covered by the
//!   signature; an unknown *kind tag* rejects the message at decode time.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::identity::AgentId;
use crate::domain::task::{TaskId, TaskStage};

/// The fixed set of KLP message kinds. Wire tags are part of the protocol;
/// never renumber an existing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest,
    TaskResult,
    TaskError,
    StatusUpdate,
    IntentionDeclaration,
    MemoryRead,
    MemoryWrite,
    PlanGraph,
    SecurityAlert,
    ConfigUpdate,
}

impl MessageKind {
    pub fn wire_tag(&self) -> u8 {
        match self {
            Self::TaskRequest => 0x01,
            Self::TaskResult => 0x02,
            Self::TaskError => 0x03,
            Self::StatusUpdate => 0x04,
            Self::IntentionDeclaration => 0x05,
            Self::MemoryRead => 0x06,
            Self::MemoryWrite => 0x07,
            Self::PlanGraph => 0x08,
            Self::SecurityAlert => 0x09,
            Self::ConfigUpdate => 0x0a,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::TaskRequest),
            0x02 => Some(Self::TaskResult),
            0x03 => Some(Self::TaskError),
            0x04 => Some(Self::StatusUpdate),
            0x05 => Some(Self::IntentionDeclaration),
            0x06 => Some(Self::MemoryRead),
            0x07 => Some(Self::MemoryWrite),
            0x08 => Some(Self::PlanGraph),
            0x09 => Some(Self::SecurityAlert),
            0x0a => Some(Self::ConfigUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TaskRequest => "task_request",
            Self::TaskResult => "task_result",
            Self::TaskError => "task_error",
            Self::StatusUpdate => "status_update",
            Self::IntentionDeclaration => "intention_declaration",
            Self::MemoryRead => "memory_read",
            Self::MemoryWrite => "memory_write",
            Self::PlanGraph => "plan_graph",
            Self::SecurityAlert => "security_alert",
            Self::ConfigUpdate => "config_update",
        };
        write!(f, "{name}")
    }
}

/// Delivery priority. Ordering is significant: `Critical` sorts above all
/// lower bands in mailbox dequeue order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn wire_tag(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequestBody {
    pub operation: String,
    pub inputs: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultBody {
    pub outcome: serde_json::Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorBody {
    pub code: String,
    pub detail: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateBody {
    pub stage: TaskStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentionDeclarationBody {
    pub intent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReadBody {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWriteBody {
    /// Ordered map: canonical serialization must not depend on insertion order.
    pub entries: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub task_id: TaskId,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGraphBody {
    pub plan_id: Uuid,
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlertBody {
    pub severity: AlertSeverity,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdateBody {
    pub key: String,
    pub value: serde_json::Value,
}

/// Kind-keyed payload union. One fixed body shape per kind — no untyped
/// dispatch on message content.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    TaskRequest(TaskRequestBody),
    TaskResult(TaskResultBody),
    TaskError(TaskErrorBody),
    StatusUpdate(StatusUpdateBody),
    IntentionDeclaration(IntentionDeclarationBody),
    MemoryRead(MemoryReadBody),
    MemoryWrite(MemoryWriteBody),
    PlanGraph(PlanGraphBody),
    SecurityAlert(SecurityAlertBody),
    ConfigUpdate(ConfigUpdateBody),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::TaskRequest(_) => MessageKind::TaskRequest,
            Self::TaskResult(_) => MessageKind::TaskResult,
            Self::TaskError(_) => MessageKind::TaskError,
            Self::StatusUpdate(_) => MessageKind::StatusUpdate,
            Self::IntentionDeclaration(_) => MessageKind::IntentionDeclaration,
            Self::MemoryRead(_) => MessageKind::MemoryRead,
            Self::MemoryWrite(_) => MessageKind::MemoryWrite,
            Self::PlanGraph(_) => MessageKind::PlanGraph,
            Self::SecurityAlert(_) => MessageKind::SecurityAlert,
            Self::ConfigUpdate(_) => MessageKind::ConfigUpdate,
        }
    }
}

/// Forward-compatibility extension entry. Unknown tags ride through decode,
/// re-encode, and signing untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub tag: u16,
    pub data: Vec<u8>,
}

/// A KLP envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct KlpMessage {
    pub from: AgentId,
    pub to: AgentId,
    pub task_id: TaskId,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub auth_token: Option<String>,
    pub priority: Option<Priority>,
    pub ttl_seconds: Option<u32>,
    pub retry_count: Option<u32>,
    pub extensions: Vec<Extension>,
    /// 64-byte Ed25519 signature over the canonical serialization of every
    /// other field. `None` until signed.
    pub signature: Option<Vec<u8>>,
}

impl KlpMessage {
    /// New unsigned message stamped with the current time.
    ///
    /// The timestamp is truncated to microseconds so a decode of the encoded
    /// envelope reproduces it exactly (the wire format carries RFC 3339 with
    /// microsecond precision).
    pub fn new(from: AgentId, to: AgentId, task_id: TaskId, payload: MessagePayload) -> Self {
        let now = Utc::now();
        let timestamp = now
            .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);
        Self {
            from,
            to,
            task_id,
            payload,
            timestamp,
            auth_token: None,
            priority: None,
            ttl_seconds: None,
            retry_count: None,
            extensions: Vec::new(),
            signature: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Priority band used for mailbox ordering (`Medium` when unset).
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// TTL check against `now`. Messages without a TTL never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now > self.timestamp + chrono::Duration::seconds(i64::from(ttl)),
            None => false,
        }
    }
}

/// Authentication of a message against a sender's registered public key.
///
/// Abstracts the canonical-bytes + Ed25519 details out of the domain; the
/// infrastructure implementation is
/// [`crate::infrastructure::signing::Ed25519Authenticator`].
pub trait MessageAuthenticator: Send + Sync {
    fn verify(&self, message: &KlpMessage, public_key: &[u8]) -> Result<(), AuthenticationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("message carries no signature")]
    MissingSignature,

    #[error("message could not be canonicalized: {0}")]
    Malformed(String),

    #[error("signature verification failed: {0}")]
    VerificationFailed(String),
}
