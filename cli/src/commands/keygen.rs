// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use kindlink_core::infrastructure::signing::Keypair;

#[derive(Args)]
pub struct KeygenCommand {
    /// Basename for the key files ({name}.key and {name}.pub)
    #[arg(long, default_value = "agent")]
    name: String,

    /// Directory to write the key files into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Overwrite existing key files
    #[arg(long)]
    force: bool,
}

pub fn execute(cmd: KeygenCommand) -> Result<()> {
    let secret_path = cmd.out_dir.join(format!("{}.key", cmd.name));
    let public_path = cmd.out_dir.join(format!("{}.pub", cmd.name));

    if !cmd.force && (secret_path.exists() || public_path.exists()) {
        anyhow::bail!(
            "{} or {} already exists (use --force to overwrite)",
            secret_path.display(),
            public_path.display()
        );
    }
    std::fs::create_dir_all(&cmd.out_dir)
        .with_context(|| format!("Failed to create {}", cmd.out_dir.display()))?;

    let keypair = Keypair::generate();
    std::fs::write(&secret_path, hex::encode(keypair.secret_bytes()))
        .with_context(|| format!("Failed to write {}", secret_path.display()))?;
    std::fs::write(&public_path, keypair.public_key_hex())
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    println!("{}", "✓ Keypair generated.".green());
    println!("  secret: {}", secret_path.display());
    println!("  public: {}  ({})", public_path.display(), keypair.public_key_hex());
    println!();
    println!(
        "{}",
        "Register the public key in the mesh identity registry; keep the secret local.".dimmed()
    );
    Ok(())
}
