// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "navet",
    version,
    about = "Hub for MCP tool servers with a ReAct agent loop"
)]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen address override, e.g. 0.0.0.0:18200
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Persistent server file override
    #[arg(long, value_name = "FILE")]
    pub servers_file: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the merged configuration and exit
    ShowConfig,
}
