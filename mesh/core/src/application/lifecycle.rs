// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Task Lifecycle Tracker
//!
//! One state-machine instance per `task_id`, with transitions serialized per
//! task: each tracked task sits behind its own lock, so at most one
//! transition is in flight at a time and later attempts observe the already
//! updated stage (no-op for idempotent duplicates, `StaleTransition`
//! otherwise). Role validation and the stage graph live on the aggregate
//! ([`crate::domain::task::Task`]); retries are gated by the failure policy
//! engine's loop detection.
//!
//! Cancellation is cooperative: the tracker flips the stage, and in-flight
//! workers are expected to observe it and wind down.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::application::failure_policy::{FailurePolicyEngine, FailurePolicyError};
use crate::domain::events::TaskEvent;
use crate::domain::task::{ActorRole, Task, TaskError, TaskId, TaskStage, TaskStatus, TransitionOutcome};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is already tracked")]
    AlreadyTracked(TaskId),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Policy(#[from] FailurePolicyError),
}

/// Tracks every live task's stage machine.
pub struct LifecycleTracker {
    tasks: DashMap<TaskId, Arc<Mutex<Task>>>,
    bus: EventBus,
    policy: Arc<FailurePolicyEngine>,
}

impl LifecycleTracker {
    pub fn new(bus: EventBus, policy: Arc<FailurePolicyEngine>) -> Self {
        Self { tasks: DashMap::new(), bus, policy }
    }

    /// Start tracking a task in its `Created` stage.
    pub fn create(&self, task: Task) -> Result<(), LifecycleError> {
        let task_id = task.task_id.clone();
        let event = TaskEvent::TaskCreated {
            task_id: task_id.clone(),
            agent_id: task.agent_id.clone(),
            plan_id: task.plan_id,
            created_at: task.created_at,
        };
        match self.tasks.entry(task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(LifecycleError::AlreadyTracked(task_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(task)));
                self.bus.publish_task_event(event);
                Ok(())
            }
        }
    }

    fn entry(&self, task_id: &TaskId) -> Result<Arc<Mutex<Task>>, LifecycleError> {
        self.tasks
            .get(task_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| LifecycleError::UnknownTask(task_id.clone()))
    }

    /// Request a stage transition as `actor`. Serialized per task.
    pub fn transition(
        &self,
        task_id: &TaskId,
        to: TaskStage,
        actor: ActorRole,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let entry = self.entry(task_id)?;
        let mut task = entry.lock();
        let from = task.stage;
        let outcome = task.transition(to, actor)?;
        drop(task);

        if outcome == TransitionOutcome::Applied {
            info!(%task_id, %from, %to, %actor, "task stage changed");
            self.bus.publish_task_event(TaskEvent::StageChanged {
                task_id: task_id.clone(),
                from,
                to,
                actor,
                changed_at: Utc::now(),
            });
        }
        Ok(outcome)
    }

    /// Cooperative cancellation, driven by the orchestrator role.
    pub fn cancel(&self, task_id: &TaskId) -> Result<TransitionOutcome, LifecycleError> {
        self.transition(task_id, TaskStage::Cancelled, ActorRole::Orchestrator)
    }

    /// Start a new retry attempt for a failed task. Rejected with the
    /// policy's escalation once the chain exceeds `max_attempts`.
    pub fn retry(&self, task_id: &TaskId) -> Result<u32, LifecycleError> {
        let entry = self.entry(task_id)?;
        let mut task = entry.lock();
        self.policy.check_retry(task_id.as_str(), task.retry_count + 1)?;
        let retry_count = task.begin_retry()?;
        drop(task);

        info!(%task_id, retry_count, "task retry started");
        self.bus.publish_task_event(TaskEvent::RetryStarted {
            task_id: task_id.clone(),
            retry_count,
            started_at: Utc::now(),
        });
        Ok(retry_count)
    }

    /// Accumulate resource usage for a running task.
    pub fn record_usage(
        &self,
        task_id: &TaskId,
        cpu_millis: u64,
        memory_bytes: u64,
        network_bytes: u64,
    ) -> Result<(), LifecycleError> {
        let entry = self.entry(task_id)?;
        entry.lock().record_usage(cpu_millis, memory_bytes, network_bytes);
        Ok(())
    }

    /// Point-in-time copy of a task.
    pub fn snapshot(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|e| e.value().lock().clone())
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|e| e.value().lock().status())
    }

    /// Stop tracking a task once it has reached a terminal stage.
    pub fn forget(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks
            .remove(task_id)
            .map(|(_, entry)| entry.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
