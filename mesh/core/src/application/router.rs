// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatch Router
//!
//! Routes authenticated KLP envelopes into per-agent mailboxes. Enforcement
//! order is fixed (first failure returns immediately):
//!
//! 1. Signature verifies against the sender's registered key (and the auth
//!    token, when one is present and a verifier is configured) — else
//!    [`RouteError::Unauthenticated`].
//! 2. TTL not elapsed — else [`RouteError::Expired`].
//! 3. Recipient has an open mailbox — else [`RouteError::UnknownRecipient`].
//! 4. Enqueue ordered by (priority desc, timestamp asc, arrival seq asc).
//!
//! Mailboxes are bounded: a full mailbox rejects with
//! [`RouteError::MailboxFull`] instead of blocking — backpressure is the
//! caller's to absorb via the failure policy engine. Every accepted or
//! rejected message is mirrored onto the event bus with its `task_id`, and
//! counted via `metrics`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::events::MessageEvent;
use crate::domain::identity::{AgentId, IdentityRegistry, TokenVerifier};
use crate::domain::message::{KlpMessage, MessageAuthenticator, MessageKind};
use crate::domain::node_config::AgentLimits;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("message from {from} failed authentication: {reason}")]
    Unauthenticated { from: AgentId, reason: String },

    #[error("message expired: sent at {timestamp}, ttl {ttl_seconds}s")]
    Expired { timestamp: DateTime<Utc>, ttl_seconds: u32 },

    #[error("unknown recipient {0}")]
    UnknownRecipient(AgentId),

    #[error("mailbox for {agent} is full (capacity {capacity})")]
    MailboxFull { agent: AgentId, capacity: usize },
}

impl RouteError {
    fn reason_label(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Expired { .. } => "expired",
            Self::UnknownRecipient(_) => "unknown_recipient",
            Self::MailboxFull { .. } => "mailbox_full",
        }
    }
}

/// Returned to the caller on successful enqueue.
#[derive(Debug, Clone)]
pub struct RouteReceipt {
    pub to: AgentId,
    pub kind: MessageKind,
    pub enqueued_at: DateTime<Utc>,
    /// Mailbox depth after the enqueue.
    pub depth: usize,
}

struct QueuedMessage {
    message: KlpMessage,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl Ord for QueuedMessage {
    // Max-heap: higher priority first; within a band, earlier timestamp
    // first, then arrival order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.message
            .effective_priority()
            .cmp(&other.message.effective_priority())
            .then_with(|| other.message.timestamp.cmp(&self.message.timestamp))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded inbound queue for one agent.
pub struct Mailbox {
    agent: AgentId,
    capacity: usize,
    queue: Mutex<BinaryHeap<QueuedMessage>>,
    notify: Notify,
    bus: EventBus,
}

impl Mailbox {
    fn new(agent: AgentId, capacity: usize, bus: EventBus) -> Self {
        Self {
            agent,
            capacity,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            bus,
        }
    }

    fn push(&self, entry: QueuedMessage) -> Result<usize, RouteError> {
        let depth = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(RouteError::MailboxFull {
                    agent: self.agent.clone(),
                    capacity: self.capacity,
                });
            }
            queue.push(entry);
            queue.len()
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Dequeue the highest-priority message, waiting if the mailbox is empty.
    pub async fn recv(&self) -> KlpMessage {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_recv(&self) -> Option<KlpMessage> {
        let entry = self.queue.lock().pop()?;
        let message = entry.message;
        self.bus.publish_message_event(MessageEvent::MessageReceived {
            to: self.agent.clone(),
            task_id: message.task_id.clone(),
            kind: message.kind(),
            received_at: Utc::now(),
        });
        counter!("klp_messages_received_total").increment(1);
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn pending_task_requests(&self) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|e| e.message.kind() == MessageKind::TaskRequest)
            .count()
    }
}

pub struct DispatchRouter {
    registry: Arc<IdentityRegistry>,
    authenticator: Arc<dyn MessageAuthenticator>,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
    mailboxes: DashMap<AgentId, Arc<Mailbox>>,
    bus: EventBus,
    limits: AgentLimits,
    mailbox_capacity: usize,
    seq: AtomicU64,
}

impl DispatchRouter {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        authenticator: Arc<dyn MessageAuthenticator>,
        bus: EventBus,
        limits: AgentLimits,
        mailbox_capacity: usize,
    ) -> Self {
        Self {
            registry,
            authenticator,
            token_verifier: None,
            mailboxes: DashMap::new(),
            bus,
            limits,
            mailbox_capacity,
            seq: AtomicU64::new(0),
        }
    }

    /// Enable auth-token verification for messages that carry one.
    pub fn with_token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.token_verifier = Some(verifier);
        self
    }

    /// Open (or return the existing) mailbox for an agent. Consumers hold
    /// the returned handle and `recv` from it.
    pub fn open_mailbox(&self, agent: AgentId) -> Arc<Mailbox> {
        self.mailboxes
            .entry(agent.clone())
            .or_insert_with(|| {
                Arc::new(Mailbox::new(agent, self.mailbox_capacity, self.bus.clone()))
            })
            .clone()
    }

    /// Close an agent's mailbox; subsequent routes to it fail with
    /// `UnknownRecipient`. Messages still held by consumers are unaffected.
    pub fn close_mailbox(&self, agent: &AgentId) {
        self.mailboxes.remove(agent);
    }

    pub fn route(&self, message: KlpMessage) -> Result<RouteReceipt, RouteError> {
        self.route_at(message, Utc::now())
    }

    /// Route with an explicit `now` (the TTL deadline is hard, so the clock
    /// is a parameter rather than buried in the check).
    pub fn route_at(
        &self,
        message: KlpMessage,
        now: DateTime<Utc>,
    ) -> Result<RouteReceipt, RouteError> {
        let rejection_context =
            (message.from.clone(), message.to.clone(), message.task_id.clone());
        match self.admit(message, now) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                let (from, to, task_id) = rejection_context;
                warn!(%from, %to, "message rejected: {e}");
                self.bus.publish_message_event(MessageEvent::MessageRejected {
                    from,
                    to,
                    task_id,
                    reason: e.to_string(),
                    rejected_at: now,
                });
                counter!("klp_messages_rejected_total", "reason" => e.reason_label())
                    .increment(1);
                Err(e)
            }
        }
    }

    fn admit(
        &self,
        message: KlpMessage,
        now: DateTime<Utc>,
    ) -> Result<RouteReceipt, RouteError> {
        // 1. Authentication: registered sender, valid signature, valid token.
        let public_key = self.registry.public_key(&message.from).ok_or_else(|| {
            RouteError::Unauthenticated {
                from: message.from.clone(),
                reason: "sender not registered".into(),
            }
        })?;
        self.authenticator.verify(&message, &public_key).map_err(|e| {
            RouteError::Unauthenticated { from: message.from.clone(), reason: e.to_string() }
        })?;
        if let (Some(token), Some(verifier)) = (&message.auth_token, &self.token_verifier) {
            verifier.verify_token(token, &message.from).map_err(|e| {
                RouteError::Unauthenticated { from: message.from.clone(), reason: e.to_string() }
            })?;
        }

        // 2. TTL is a hard deadline.
        if message.is_expired(now) {
            return Err(RouteError::Expired {
                timestamp: message.timestamp,
                ttl_seconds: message.ttl_seconds.unwrap_or(0),
            });
        }

        // 3. Destination mailbox.
        let mailbox = self
            .mailboxes
            .get(&message.to)
            .map(|e| e.value().clone())
            .ok_or_else(|| RouteError::UnknownRecipient(message.to.clone()))?;

        // Admission control: cap queued work, not just queued bytes.
        if message.kind() == MessageKind::TaskRequest
            && mailbox.pending_task_requests() >= self.limits.max_tasks
        {
            return Err(RouteError::MailboxFull {
                agent: message.to.clone(),
                capacity: self.limits.max_tasks,
            });
        }

        // 4. Enqueue.
        self.enqueue(message, mailbox, now)
    }

    fn enqueue(
        &self,
        message: KlpMessage,
        mailbox: Arc<Mailbox>,
        now: DateTime<Utc>,
    ) -> Result<RouteReceipt, RouteError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let from = message.from.clone();
        let to = message.to.clone();
        let task_id = message.task_id.clone();
        let kind = message.kind();
        let priority = message.effective_priority();

        let depth = mailbox.push(QueuedMessage { message, seq })?;

        debug!(%from, %to, %task_id, %kind, "message enqueued");
        self.bus.publish_message_event(MessageEvent::MessageSent {
            from,
            to: to.clone(),
            task_id,
            kind,
            priority,
            sent_at: now,
        });
        counter!("klp_messages_routed_total").increment(1);
        Ok(RouteReceipt { to, kind, enqueued_at: now, depth })
    }
}
