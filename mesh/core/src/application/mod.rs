// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

pub mod router;
pub mod lifecycle;
pub mod updater;
pub mod failure_policy;

pub use failure_policy::{FailurePolicyEngine, FailurePolicyError, RetryError};
pub use lifecycle::{LifecycleError, LifecycleTracker};
pub use router::{DispatchRouter, Mailbox, RouteError, RouteReceipt};
pub use updater::{check_eligible, rollout_bucket, RolloutController, UpdateError, UpdateReport};
