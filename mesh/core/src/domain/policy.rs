// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Failure Policy Configuration
//!
//! Declarative retry/backoff/escalation settings shared by the dispatch and
//! update paths. The enforcement engine (circuit breaker, retry loop) lives
//! in [`crate::application::failure_policy`]; these types are pure policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Where to route a failure once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Notify the owning user/operator.
    #[serde(default = "default_true")]
    pub to_user: bool,
    /// Named fallback plan to activate, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_plan: Option<String>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self { to_user: true, fallback_plan: None }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Consecutive failures against one target before the circuit opens and
    /// the failure escalates.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    /// How long an open circuit waits before allowing a half-open probe.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(default)]
    pub escalation: EscalationPolicy,
}

/// Backoff delays are capped so a long exponential chain cannot stall a
/// mailbox consumer for minutes.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl RetryPolicy {
    /// Delay before the next attempt, given the 1-based attempt that just
    /// failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let shift = (attempt - 1).min(16);
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        delay.min(MAX_BACKOFF)
    }

    /// Loop detection: a retry chain whose count has reached `max_attempts`
    /// must escalate instead of retrying.
    pub fn retries_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            base_delay: default_base_delay(),
            alert_threshold: default_alert_threshold(),
            cooldown: default_cooldown(),
            escalation: EscalationPolicy::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_alert_threshold() -> u32 {
    3
}
fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}
