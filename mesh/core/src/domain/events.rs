// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::AgentId;
use crate::domain::message::{MessageKind, Priority};
use crate::domain::task::{ActorRole, TaskId, TaskStage};
use crate::domain::update::{UpdatePhase, Version};
use uuid::Uuid;

/// Message-path observability events emitted by the dispatch router and
/// mailboxes, correlated by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageEvent {
    MessageSent {
        from: AgentId,
        to: AgentId,
        task_id: TaskId,
        kind: MessageKind,
        priority: Priority,
        sent_at: DateTime<Utc>,
    },
    MessageReceived {
        to: AgentId,
        task_id: TaskId,
        kind: MessageKind,
        received_at: DateTime<Utc>,
    },
    MessageRejected {
        from: AgentId,
        to: AgentId,
        task_id: TaskId,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
}

/// Task lifecycle events emitted by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    TaskCreated {
        task_id: TaskId,
        agent_id: AgentId,
        plan_id: Uuid,
        created_at: DateTime<Utc>,
    },
    StageChanged {
        task_id: TaskId,
        from: TaskStage,
        to: TaskStage,
        actor: ActorRole,
        changed_at: DateTime<Utc>,
    },
    RetryStarted {
        task_id: TaskId,
        retry_count: u32,
        started_at: DateTime<Utc>,
    },
}

/// Update-path events emitted by the rollout controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateEvent {
    UpdateStarted {
        manifest_id: String,
        version: Version,
        started_at: DateTime<Utc>,
    },
    PhaseReached {
        manifest_id: String,
        phase: UpdatePhase,
        at: DateTime<Utc>,
    },
    UpdateCommitted {
        manifest_id: String,
        version: Version,
        committed_at: DateTime<Utc>,
    },
    UpdateRolledBack {
        manifest_id: String,
        failed_phase: UpdatePhase,
        rolled_back_at: DateTime<Utc>,
    },
}

impl MessageEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::MessageSent { task_id, .. }
            | Self::MessageReceived { task_id, .. }
            | Self::MessageRejected { task_id, .. } => task_id,
        }
    }
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::StageChanged { task_id, .. }
            | Self::RetryStarted { task_id, .. } => task_id,
        }
    }
}
