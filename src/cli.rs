// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "norn",
    version,
    about = "An OS-inspired asynchronous task scheduler for LLM agents"
)]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Model override: "provider/model", a bare provider id, a bare model
    /// name, or a named provider from the config
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler with the HTTP gateway until interrupted
    Serve {
        /// Bind address override, e.g. 127.0.0.1:8000
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit one goal, wait for it to settle, and print the result
    Run {
        /// The goal to decompose and execute
        goal: String,

        /// Task type to submit ("planning" decomposes the goal; "reasoning"
        /// runs it as a single leaf)
        #[arg(long, default_value = "planning")]
        task_type: String,
    },

    /// List registered model providers
    ListProviders {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Print the merged effective configuration as YAML
    ShowConfig,
}
