// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Failure Policy Engine
//!
//! Shared retry/backoff enforcement for the dispatch and update paths:
//! per-target circuit breaking, retry-loop detection, and a bounded retry
//! executor. Policy values come from [`RetryPolicy`]
//! (see [`crate::domain::policy`]).
//!
//! ## Circuit lifecycle
//!
//! ```text
//! Closed ──(alert_threshold consecutive failures)──▶ Open
//! Open ──(cooldown elapses, next guard)──▶ HalfOpen (one probe in flight)
//! HalfOpen ──(probe succeeds)──▶ Closed
//! HalfOpen ──(probe fails)──▶ Open
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::policy::{EscalationPolicy, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailurePolicyError {
    #[error("circuit open for target `{target}` until {until}")]
    CircuitOpen { target: String, until: DateTime<Utc> },

    #[error("retry chain for `{target}` exhausted after {retry_count} attempts")]
    RetriesExhausted {
        target: String,
        retry_count: u32,
        escalation: EscalationPolicy,
    },
}

/// Terminal outcome of [`FailurePolicyEngine::run_with_retry`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Policy(#[from] FailurePolicyError),

    #[error("operation failed after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
        escalation: EscalationPolicy,
    },
}

/// Retry/backoff/circuit-breaking engine keyed by target (an agent ID, an
/// update channel, a release endpoint).
pub struct FailurePolicyEngine {
    policy: RetryPolicy,
    breakers: DashMap<String, BreakerState>,
}

impl FailurePolicyEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, breakers: DashMap::new() }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Admission check before attempting an operation against `target`.
    ///
    /// Open circuits short-circuit with [`FailurePolicyError::CircuitOpen`]
    /// until the cooldown elapses; the first guard after cooldown moves the
    /// circuit to half-open and admits exactly one probe.
    pub fn guard(&self, target: &str) -> Result<(), FailurePolicyError> {
        let mut entry = self
            .breakers
            .entry(target.to_string())
            .or_insert(BreakerState::Closed { consecutive_failures: 0 });
        match *entry {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Utc::now() >= until {
                    debug!(target, "circuit cooldown elapsed, admitting half-open probe");
                    *entry = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(FailurePolicyError::CircuitOpen { target: target.to_string(), until })
                }
            }
            // One probe at a time: further callers wait for its outcome.
            BreakerState::HalfOpen => {
                let until = Utc::now();
                Err(FailurePolicyError::CircuitOpen { target: target.to_string(), until })
            }
        }
    }

    pub fn record_success(&self, target: &str) {
        self.breakers
            .insert(target.to_string(), BreakerState::Closed { consecutive_failures: 0 });
    }

    pub fn record_failure(&self, target: &str) {
        let mut entry = self
            .breakers
            .entry(target.to_string())
            .or_insert(BreakerState::Closed { consecutive_failures: 0 });
        let next = match *entry {
            BreakerState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.policy.alert_threshold {
                    warn!(target, failures, "circuit opened");
                    BreakerState::Open { until: Utc::now() + chrono::Duration::from_std(self.policy.cooldown).unwrap_or_else(|_| chrono::Duration::zero()) }
                } else {
                    BreakerState::Closed { consecutive_failures: failures }
                }
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => {
                warn!(target, "half-open probe failed, circuit reopened");
                BreakerState::Open { until: Utc::now() + chrono::Duration::from_std(self.policy.cooldown).unwrap_or_else(|_| chrono::Duration::zero()) }
            }
        };
        *entry = next;
    }

    /// Loop detection: reject a retry chain whose `retry_count` has reached
    /// `max_attempts`, escalating per policy instead of retrying forever.
    pub fn check_retry(&self, target: &str, retry_count: u32) -> Result<(), FailurePolicyError> {
        if self.policy.retries_exhausted(retry_count) {
            return Err(FailurePolicyError::RetriesExhausted {
                target: target.to_string(),
                retry_count,
                escalation: self.policy.escalation.clone(),
            });
        }
        Ok(())
    }

    /// Run `op` against `target` under the full policy: circuit guard before
    /// each attempt, backoff between attempts, breaker bookkeeping on each
    /// outcome, escalation when attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run_with_retry<F, Fut, T, E>(
        &self,
        target: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.guard(target)?;

            match op(attempt).await {
                Ok(value) => {
                    self.record_success(target);
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure(target);
                    warn!(target, attempt, "attempt failed: {e}");
                    if attempt >= self.policy.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                            escalation: self.policy.escalation.clone(),
                        });
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
            }
        }
    }
}
