// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use kindlink_core::domain::node_config::NodeConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate a node configuration file
    Validate {
        /// Path to the YAML config file
        file: PathBuf,
    },

    /// Print a commented starter configuration
    Generate {
        /// Agent ID to embed
        #[arg(long, default_value = "agent-01")]
        agent_id: String,
    },
}

pub fn handle_command(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Validate { file } => validate(&file),
        ConfigCommand::Generate { agent_id } => generate(&agent_id),
    }
}

fn validate(file: &PathBuf) -> Result<()> {
    let config = NodeConfig::load(file).map_err(|e| anyhow::anyhow!(e))?;

    println!("{}", "✓ Configuration is valid.".green());
    println!("  agent_id:         {}", config.agent_id);
    println!("  channel:          {}", config.channel);
    println!("  mailbox_capacity: {}", config.mailbox_capacity);
    println!("  max_tasks:        {}", config.limits.max_tasks);
    println!("  beacon interval:  {:?}", config.beacon.interval);
    Ok(())
}

fn generate(agent_id: &str) -> Result<()> {
    println!(
        "\
# KLP mesh node configuration
agent_id: {agent_id}
channel: stable          # stable | beta | nightly
mailbox_capacity: 256

limits:
  max_tasks: 8
  autonomy_level: 50     # 0 = supervised, 100 = fully autonomous
  sandboxed: true

retry:
  max_attempts: 5
  backoff: exponential   # exponential | linear | fixed
  base_delay: 500ms
  alert_threshold: 3
  cooldown: 30s

beacon:
  interval: 30s
  # sink_url: https://monitor.example/beacons

update:
  # manifest_url: https://releases.example/stable/manifest.json
  install_path: /var/lib/kindlink/agent.bin
  staging_dir: /var/lib/kindlink/staging
  backup_dir: /var/lib/kindlink/backups
  # release_key: <hex ed25519 public key>"
    );
    Ok(())
}
