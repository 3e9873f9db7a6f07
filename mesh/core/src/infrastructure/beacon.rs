// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Health Beacon Producer
//!
//! Periodic liveness beacon each agent process emits for the external
//! monitor (the consumer side — restart/alerting — is out of scope). The
//! emitter POSTs the beacon JSON to the configured sink at the configured
//! interval; `current()` builds the same payload for in-process probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::identity::AgentId;
use crate::domain::node_config::BeaconConfig;

/// Error counts at or above this mark the agent degraded / errored.
const DEGRADED_THRESHOLD: u64 = 1;
const ERROR_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconStatus {
    Alive,
    Degraded,
    Error,
}

/// One beacon emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthBeacon {
    pub id: AgentId,
    pub status: BeaconStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub error_count: u64,
    pub timestamp: DateTime<Utc>,
}

pub struct BeaconEmitter {
    agent_id: AgentId,
    version: String,
    config: BeaconConfig,
    client: reqwest::Client,
    started_at: Instant,
    errors: Arc<AtomicU64>,
}

impl BeaconEmitter {
    pub fn new(agent_id: AgentId, version: impl Into<String>, config: BeaconConfig) -> Self {
        Self {
            agent_id,
            version: version.into(),
            config,
            client: reqwest::Client::new(),
            started_at: Instant::now(),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter the host process bumps on task/update failures.
    pub fn error_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.errors)
    }

    pub fn current(&self) -> HealthBeacon {
        let error_count = self.errors.load(Ordering::Relaxed);
        let status = if error_count >= ERROR_THRESHOLD {
            BeaconStatus::Error
        } else if error_count >= DEGRADED_THRESHOLD {
            BeaconStatus::Degraded
        } else {
            BeaconStatus::Alive
        };
        HealthBeacon {
            id: self.agent_id.clone(),
            status,
            version: self.version.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            error_count,
            timestamp: Utc::now(),
        }
    }

    /// Emit beacons until the task is dropped. No sink configured means the
    /// loop only logs.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let beacon = self.current();
            debug!(agent = %beacon.id, status = ?beacon.status, "emitting health beacon");

            let Some(sink) = &self.config.sink_url else {
                continue;
            };
            // A failed beacon POST is logged, not counted: the error counter
            // tracks agent work failures, and a flaky monitor must not be
            // able to flip the agent's own status.
            if let Err(e) = self.client.post(sink).json(&beacon).send().await {
                warn!(sink = %sink, "beacon emission failed: {e}");
            }
        }
    }
}
