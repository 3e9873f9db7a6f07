// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! # KLP Mesh Operator CLI
//!
//! The `klp` binary is the operator's toolbox for a mesh node:
//!
//! - `klp keygen` - generate an agent's Ed25519 keypair
//! - `klp manifest validate|eligible` - check release manifests offline
//! - `klp envelope inspect` - decode (and optionally verify) a KLP envelope
//! - `klp config validate` - check a node configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{ConfigCommand, EnvelopeCommand, KeygenCommand, ManifestCommand};

/// Kind Link Protocol mesh tooling
#[derive(Parser)]
#[command(name = "klp")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "KLP_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an agent keypair
    #[command(name = "keygen")]
    Keygen {
        #[command(flatten)]
        command: KeygenCommand,
    },

    /// Release manifest checks
    #[command(name = "manifest")]
    Manifest {
        #[command(subcommand)]
        command: ManifestCommand,
    },

    /// KLP envelope inspection
    #[command(name = "envelope")]
    Envelope {
        #[command(subcommand)]
        command: EnvelopeCommand,
    },

    /// Node configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Keygen { command }) => commands::keygen::execute(command),
        Some(Commands::Manifest { command }) => commands::manifest::handle_command(command),
        Some(Commands::Envelope { command }) => commands::envelope::handle_command(command),
        Some(Commands::Config { command }) => commands::config::handle_command(command),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
