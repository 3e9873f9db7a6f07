// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # kindlink-core
//!
//! Signed task-dispatch and update-rollout core for the Kind Link Protocol
//! (KLP) mesh.
//!
//! # Architecture
//!
//! - **domain** — identities, messages, tasks, manifests, policy; pure types
//!   and aggregate behavior.
//! - **application** — dispatch router, lifecycle tracker, rollout
//!   controller, failure policy engine.
//! - **infrastructure** — Ed25519 signing, KLP wire codec, event bus, HTTP
//!   release client, filesystem artifact store, health beacon, auth tokens.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
