// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the KLP CLI

pub mod keygen;
pub mod manifest;
pub mod envelope;
pub mod config;

pub use self::config::ConfigCommand;
pub use self::envelope::EnvelopeCommand;
pub use self::keygen::KeygenCommand;
pub use self::manifest::ManifestCommand;
