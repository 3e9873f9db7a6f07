// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate & Stage Machine
//!
//! One [`Task`] per `task_id`, moving through the stage graph
//!
//! ```text
//! Created → Planned → Spawned → Running → {Completed | Failed}
//!                                              └→ Reviewed → MemoryUpdated (terminal)
//! Cancelled reachable from any non-terminal stage.
//! ```
//!
//! Every edge requires a specific acting role (see [`TaskStage::required_role`]).
//! Stages advance monotonically; the only way back to `Created` is an explicit
//! retry, which starts a fresh attempt with an incremented `retry_count`.
//! Serialization of concurrent transitions is the tracker's concern
//! ([`crate::application::lifecycle`]); the aggregate validates edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::identity::AgentId;

/// Task identifier; correlates a causal chain of messages and sub-tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fine-grained lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Created,
    Planned,
    Spawned,
    Running,
    Completed,
    Failed,
    Reviewed,
    MemoryUpdated,
    Cancelled,
}

/// Coarse status derived from [`TaskStage`] for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Role required to drive a given lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Planner,
    Dispatcher,
    Worker,
    Reviewer,
    MemoryKeeper,
    Orchestrator,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planner => "planner",
            Self::Dispatcher => "dispatcher",
            Self::Worker => "worker",
            Self::Reviewer => "reviewer",
            Self::MemoryKeeper => "memory_keeper",
            Self::Orchestrator => "orchestrator",
        };
        write!(f, "{name}")
    }
}

impl TaskStage {
    /// Terminal stages accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MemoryUpdated | Self::Cancelled)
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition(&self, to: TaskStage) -> bool {
        use TaskStage::*;
        match (self, to) {
            (Created, Planned)
            | (Planned, Spawned)
            | (Spawned, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Completed, Reviewed)
            | (Failed, Reviewed)
            | (Reviewed, MemoryUpdated) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Acting role required for the `self → to` edge, if the edge exists.
    pub fn required_role(&self, to: TaskStage) -> Option<ActorRole> {
        use TaskStage::*;
        if !self.can_transition(to) {
            return None;
        }
        let role = match (self, to) {
            (Created, Planned) => ActorRole::Planner,
            (Planned, Spawned) => ActorRole::Dispatcher,
            (Spawned, Running) | (Running, Completed) | (Running, Failed) => ActorRole::Worker,
            (Completed, Reviewed) | (Failed, Reviewed) => ActorRole::Reviewer,
            (Reviewed, MemoryUpdated) => ActorRole::MemoryKeeper,
            (_, Cancelled) => ActorRole::Orchestrator,
            _ => unreachable!("can_transition covers the edge set"),
        };
        Some(role)
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Created | Self::Planned | Self::Spawned => TaskStatus::Pending,
            Self::Running => TaskStatus::Running,
            Self::Completed | Self::Reviewed | Self::MemoryUpdated => TaskStatus::Completed,
            Self::Failed => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Planned => "planned",
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Reviewed => "reviewed",
            Self::MemoryUpdated => "memory_updated",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Resources consumed by a task while running. Accumulates monotonically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFootprint {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub network_bytes: u64,
}

impl ResourceFootprint {
    pub fn accumulate(&mut self, cpu_millis: u64, memory_bytes: u64, network_bytes: u64) {
        self.cpu_millis += cpu_millis;
        self.memory_bytes += memory_bytes;
        self.network_bytes += network_bytes;
    }
}

/// Lifecycle violations. See [`crate::application::lifecycle`] for the
/// tracker-level errors that wrap these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("unauthorized transition {from} -> {to} on {task_id}: requires {required}, actor was {actor}")]
    UnauthorizedTransition {
        task_id: TaskId,
        from: TaskStage,
        to: TaskStage,
        required: ActorRole,
        actor: ActorRole,
    },

    #[error("stale transition {from} -> {to} on {task_id}")]
    StaleTransition {
        task_id: TaskId,
        from: TaskStage,
        to: TaskStage,
    },

    #[error("task {task_id} in stage {stage} cannot start a retry")]
    NotRetryable { task_id: TaskId, stage: TaskStage },
}

/// Outcome of a transition request under per-task serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The edge was applied and the stage advanced.
    Applied,
    /// The task was already in the requested stage; the request was a
    /// duplicate of an idempotent edge and nothing changed.
    NoOp,
}

/// Aggregate root for one task attempt chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Parent task, when this is a sub-task. Sub-tasks share the parent's
    /// `plan_id` but run their own stage machine; aggregate status across a
    /// sub-task tree is the caller's concern.
    pub parent_id: Option<TaskId>,
    pub plan_id: Uuid,
    /// Current owner.
    pub agent_id: AgentId,
    pub stage: TaskStage,
    /// Number of completed retry attempts. Incremented only by
    /// [`Task::begin_retry`].
    pub retry_count: u32,
    pub footprint: ResourceFootprint,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: TaskId, plan_id: Uuid, agent_id: AgentId) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            parent_id: None,
            plan_id,
            agent_id,
            stage: TaskStage::Created,
            retry_count: 0,
            footprint: ResourceFootprint::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sub-task constructor: inherits the parent's `plan_id`.
    pub fn sub_task(task_id: TaskId, parent: &Task, agent_id: AgentId) -> Self {
        let mut task = Self::new(task_id, parent.plan_id, agent_id);
        task.parent_id = Some(parent.task_id.clone());
        task
    }

    pub fn status(&self) -> TaskStatus {
        self.stage.status()
    }

    /// Request the `self.stage → to` edge as `actor`.
    ///
    /// A repeated request for the stage the task is already in no-ops
    /// (idempotent duplicate); any other non-edge request is stale.
    pub fn transition(
        &mut self,
        to: TaskStage,
        actor: ActorRole,
    ) -> Result<TransitionOutcome, TaskError> {
        if self.stage == to {
            return Ok(TransitionOutcome::NoOp);
        }
        let required = self.stage.required_role(to).ok_or(TaskError::StaleTransition {
            task_id: self.task_id.clone(),
            from: self.stage,
            to,
        })?;
        if required != actor {
            return Err(TaskError::UnauthorizedTransition {
                task_id: self.task_id.clone(),
                from: self.stage,
                to,
                required,
                actor,
            });
        }
        self.stage = to;
        self.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }

    /// Start a new attempt: same `task_id`, stage machine reset to `Created`,
    /// `retry_count + 1`, footprint reset. Only a `Failed` task can retry;
    /// loop detection against `max_attempts` is the failure policy engine's
    /// job ([`crate::domain::policy::RetryPolicy`]).
    pub fn begin_retry(&mut self) -> Result<u32, TaskError> {
        if self.stage != TaskStage::Failed {
            return Err(TaskError::NotRetryable {
                task_id: self.task_id.clone(),
                stage: self.stage,
            });
        }
        self.stage = TaskStage::Created;
        self.retry_count += 1;
        self.footprint = ResourceFootprint::default();
        self.updated_at = Utc::now();
        Ok(self.retry_count)
    }

    /// Record resource usage. Only meaningful while running; calls in other
    /// stages are ignored so late usage reports cannot mutate a settled task.
    pub fn record_usage(&mut self, cpu_millis: u64, memory_bytes: u64, network_bytes: u64) {
        if self.stage == TaskStage::Running {
            self.footprint.accumulate(cpu_millis, memory_bytes, network_bytes);
        }
    }
}
