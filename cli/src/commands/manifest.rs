// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use kindlink_core::application::updater::{check_eligible, rollout_bucket};
use kindlink_core::domain::identity::AgentId;
use kindlink_core::domain::update::{UpdateChannel, UpdateManifest, Version};

#[derive(Subcommand)]
pub enum ManifestCommand {
    /// Validate a manifest file (JSON or YAML)
    Validate {
        /// Path to the manifest file
        file: PathBuf,
    },

    /// Check whether an agent is eligible for a manifest
    Eligible {
        /// Path to the manifest file
        file: PathBuf,

        /// Agent ID to evaluate the rollout gate for
        #[arg(long)]
        agent_id: String,

        /// Version currently installed on the agent
        #[arg(long)]
        current_version: String,

        /// Channel the agent subscribes to
        #[arg(long, default_value = "stable")]
        channel: String,

        /// Evaluate at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },
}

pub fn handle_command(command: ManifestCommand) -> Result<()> {
    match command {
        ManifestCommand::Validate { file } => validate(&file),
        ManifestCommand::Eligible { file, agent_id, current_version, channel, at } => {
            eligible(&file, &agent_id, &current_version, &channel, at.as_deref())
        }
    }
}

fn load(file: &Path) -> Result<UpdateManifest> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let manifest: UpdateManifest = match file.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&raw).context("Failed to parse YAML manifest")?
        }
        _ => serde_json::from_str(&raw).context("Failed to parse JSON manifest")?,
    };
    Ok(manifest)
}

fn validate(file: &Path) -> Result<()> {
    let manifest = load(file)?;
    manifest.validate().map_err(|e| anyhow::anyhow!(e))?;

    println!("{}", "✓ Manifest is valid.".green());
    println!("  id:      {}", manifest.id);
    println!("  version: {} ({})", manifest.version, manifest.channel);
    println!("  url:     {}", manifest.url);
    if manifest.rollout.staged {
        println!(
            "  rollout: staged, {}% batch, {} → {}",
            manifest.rollout.batch_percent, manifest.rollout.start_time, manifest.rollout.end_time
        );
    }
    if manifest.mandatory {
        println!("  {}", "mandatory update".yellow());
    }
    Ok(())
}

fn eligible(
    file: &Path,
    agent_id: &str,
    current_version: &str,
    channel: &str,
    at: Option<&str>,
) -> Result<()> {
    let manifest = load(file)?;
    manifest.validate().map_err(|e| anyhow::anyhow!(e))?;

    let agent = AgentId::new(agent_id);
    let current: Version = current_version.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
    let subscribed: UpdateChannel = channel.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
    let now = match at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .context("Invalid --at instant (expected RFC 3339)")?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let bucket = rollout_bucket(&agent, &manifest.id);
    if check_eligible(&manifest, &agent, subscribed, &current, now) {
        println!("{}", format!("✓ {agent_id} is eligible (bucket {bucket}).").green());
    } else {
        println!("{}", format!("✗ {agent_id} is not eligible (bucket {bucket}).").red());
        std::process::exit(1);
    }
    Ok(())
}
