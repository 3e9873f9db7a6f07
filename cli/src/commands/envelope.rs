// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use kindlink_core::infrastructure::codec;
use kindlink_core::infrastructure::signing::verify_detached;

#[derive(Subcommand)]
pub enum EnvelopeCommand {
    /// Decode a binary KLP envelope and print its fields
    Inspect {
        /// Path to the envelope file
        file: PathBuf,

        /// Hex Ed25519 public key to verify the signature against
        #[arg(long)]
        public_key: Option<String>,
    },
}

pub fn handle_command(command: EnvelopeCommand) -> Result<()> {
    match command {
        EnvelopeCommand::Inspect { file, public_key } => inspect(&file, public_key.as_deref()),
    }
}

fn inspect(file: &PathBuf, public_key: Option<&str>) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let message = codec::decode(&bytes).map_err(|e| anyhow::anyhow!(e))?;

    println!("{}", "KLP envelope".bold());
    println!("  kind:      {}", message.kind());
    println!("  from:      {}", message.from);
    println!("  to:        {}", message.to);
    println!("  task_id:   {}", message.task_id);
    println!("  timestamp: {}", message.timestamp.to_rfc3339());
    println!("  priority:  {:?}", message.effective_priority());
    if let Some(ttl) = message.ttl_seconds {
        println!("  ttl:       {ttl}s");
    }
    if let Some(retry) = message.retry_count {
        println!("  retries:   {retry}");
    }
    if message.auth_token.is_some() {
        println!("  auth:      token present");
    }
    if !message.extensions.is_empty() {
        let tags: Vec<String> =
            message.extensions.iter().map(|e| format!("{:#06x}", e.tag)).collect();
        println!("  ext tags:  {}", tags.join(", "));
    }

    match (&message.signature, public_key) {
        (Some(signature), Some(key_hex)) => {
            let key = hex::decode(key_hex).context("Invalid --public-key hex")?;
            let payload = codec::signing_bytes(&message).map_err(|e| anyhow::anyhow!(e))?;
            match verify_detached(&key, &payload, signature) {
                Ok(()) => println!("{}", "✓ Signature verifies.".green()),
                Err(e) => {
                    println!("{}", format!("✗ Signature invalid: {e}").red());
                    std::process::exit(1);
                }
            }
        }
        (Some(_), None) => println!("  signature: present (pass --public-key to verify)"),
        (None, _) => println!("  signature: {}", "absent".yellow()),
    }
    Ok(())
}
