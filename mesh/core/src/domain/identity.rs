// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Identity & Key Registry
//!
//! Domain model for mesh participants. Every agent is identified by a
//! globally unique string ID and a registered Ed25519 public key; the
//! [`IdentityRegistry`] is the trust root for message authentication
//! (see [`crate::application::router`]).
//!
//! ## Invariants
//!
//! - An [`AgentIdentity`] is immutable once registered. The only mutation
//!   the registry supports is revocation, which removes the entry.
//! - `trust_level` is always within `0..=100` — enforced at construction.
//! - `public_key` is always exactly 32 bytes (Ed25519).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use dashmap::DashMap;

/// Length of a registered Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Globally unique agent identifier (e.g. `"planner-01"`, `"worker-eu-3"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors raised by identity construction and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("agent id must not be empty")]
    EmptyAgentId,

    #[error("invalid public key length: {0} bytes (must be {PUBLIC_KEY_LEN})")]
    InvalidPublicKey(usize),

    #[error("trust level {0} out of range (0-100)")]
    TrustLevelOutOfRange(u8),

    #[error("agent {0} is already registered")]
    AlreadyRegistered(AgentId),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),
}

/// A registered mesh participant.
///
/// Key compromise handling is out of scope for this core; revocation is
/// removal from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    /// Ed25519 public key (32 bytes).
    pub public_key: Vec<u8>,
    /// Capability tags the agent advertises (e.g. `"plan"`, `"execute"`).
    pub capabilities: BTreeSet<String>,
    /// Operator-assigned trust level, 0 (untrusted) to 100 (fully trusted).
    pub trust_level: u8,
}

impl AgentIdentity {
    pub fn new(
        agent_id: AgentId,
        public_key: Vec<u8>,
        capabilities: impl IntoIterator<Item = String>,
        trust_level: u8,
    ) -> Result<Self, IdentityError> {
        if agent_id.as_str().is_empty() {
            return Err(IdentityError::EmptyAgentId);
        }
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(IdentityError::InvalidPublicKey(public_key.len()));
        }
        if trust_level > 100 {
            return Err(IdentityError::TrustLevelOutOfRange(trust_level));
        }
        Ok(Self {
            agent_id,
            public_key,
            capabilities: capabilities.into_iter().collect(),
            trust_level,
        })
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Concurrent, read-mostly registry of agent identities.
///
/// Safe for concurrent lookup from router and controller tasks; writes
/// (register/revoke) are expected to be rare.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    identities: DashMap<AgentId, AgentIdentity>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new identity. Identities are immutable: re-registering an
    /// existing agent ID is rejected rather than overwritten.
    pub fn register(&self, identity: AgentIdentity) -> Result<(), IdentityError> {
        match self.identities.entry(identity.agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(IdentityError::AlreadyRegistered(identity.agent_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(identity);
                Ok(())
            }
        }
    }

    /// Revoke an identity. Returns the removed identity, or `UnknownAgent`.
    pub fn revoke(&self, agent_id: &AgentId) -> Result<AgentIdentity, IdentityError> {
        self.identities
            .remove(agent_id)
            .map(|(_, identity)| identity)
            .ok_or_else(|| IdentityError::UnknownAgent(agent_id.clone()))
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentIdentity> {
        self.identities.get(agent_id).map(|e| e.value().clone())
    }

    /// Registered public key for an agent, if any.
    pub fn public_key(&self, agent_id: &AgentId) -> Option<Vec<u8>> {
        self.identities.get(agent_id).map(|e| e.public_key.clone())
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.identities.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Verification of the optional per-message auth token.
///
/// Keeps the domain free of JWT library details; the infrastructure
/// implementation lives in [`crate::infrastructure::token`].
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and confirm it was issued to `expected_agent`.
    fn verify_token(&self, token: &str, expected_agent: &AgentId) -> Result<(), TokenError>;
}

/// Errors raised by auth-token verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid auth token: {0}")]
    Invalid(String),

    #[error("auth token subject mismatch: expected {expected}, found {found}")]
    SubjectMismatch { expected: AgentId, found: String },
}
