// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Multi-agent topic chat server", version)]
pub struct Cli {
    /// Path to the config file (default: ./parley.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the actor runtime: connect Redis, activate the configured agents,
    /// and serve until interrupted.  This is the default command.
    Serve,

    /// Print the resolved configuration and exit.
    ShowConfig,

    /// Validate the configuration (agents, topics, LLM configs) and exit.
    Check,
}
