// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
// Event Bus - Pub/Sub for Mesh Events
//
// In-memory event streaming over tokio broadcast channels. Feeds the CLI,
// liveness monitors, and any in-process observer; events are lost on restart.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{MessageEvent, TaskEvent, UpdateEvent};
use crate::domain::task::TaskId;

/// Unified event type for the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    Message(MessageEvent),
    Task(TaskEvent),
    Update(UpdateEvent),
}

/// Broadcast bus for mesh events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<MeshEvent>>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity; old events are dropped
    /// once the buffer is full and a subscriber lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender: Arc::new(sender) }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_message_event(&self, event: MessageEvent) {
        self.publish(MeshEvent::Message(event));
    }

    pub fn publish_task_event(&self, event: TaskEvent) {
        self.publish(MeshEvent::Task(event));
    }

    pub fn publish_update_event(&self, event: UpdateEvent) {
        self.publish(MeshEvent::Update(event));
    }

    fn publish(&self, event: MeshEvent) {
        debug!("Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all mesh events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }

    /// Subscribe to message/task events for a single task ID — useful for
    /// streaming one causal chain.
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver { receiver: self.sender.subscribe(), task_id }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all mesh events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one task's message/task events.
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            let matches = match &event {
                MeshEvent::Message(m) => m.task_id() == &self.task_id,
                MeshEvent::Task(t) => t.task_id() == &self.task_id,
                MeshEvent::Update(_) => false,
            };
            if matches {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::AgentId;
    use crate::domain::message::{MessageKind, Priority};
    use chrono::Utc;

    fn sent(task: &str) -> MessageEvent {
        MessageEvent::MessageSent {
            from: AgentId::from("a"),
            to: AgentId::from("b"),
            task_id: TaskId::from(task),
            kind: MessageKind::TaskRequest,
            priority: Priority::Medium,
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.publish_message_event(sent("t-1"));

        match receiver.recv().await.unwrap() {
            MeshEvent::Message(MessageEvent::MessageSent { task_id, .. }) => {
                assert_eq!(task_id, TaskId::from("t-1"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_task_filtering() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_task(TaskId::from("t-2"));

        bus.publish_message_event(sent("t-1"));
        bus.publish_message_event(sent("t-2"));

        match receiver.recv().await.unwrap() {
            MeshEvent::Message(MessageEvent::MessageSent { task_id, .. }) => {
                assert_eq!(task_id, TaskId::from("t-2"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish_message_event(sent("t-3"));
        let _ = r1.recv().await.unwrap();
        let _ = r2.recv().await.unwrap();
    }
}
