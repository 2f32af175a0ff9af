//! CLI command definitions for claimboard
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-agent task claiming and collaboration scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reaper, the backlog mirror and (with pool.command set) the
    /// worker pool until interrupted (default if no subcommand given)
    Serve(ServeArgs),

    /// Run one command and print its JSON result
    Call(CallArgs),

    /// Reap stale sessions and expired locks once
    Reap(ReapArgs),

    /// List the available commands and their argument schemas
    Tools,
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Shell command run for each claimed task (overrides pool.command)
    #[arg(long)]
    pub command: Option<String>,

    /// Do not write the backlog mirror
    #[arg(long)]
    pub no_mirror: bool,
}

#[derive(clap::Args, Debug)]
pub struct CallArgs {
    /// Command name, e.g. claim or create_task
    pub tool: String,

    /// Arguments as a JSON object
    #[arg(default_value = "{}")]
    pub arguments: String,

    /// Pretty-print the result
    #[arg(long)]
    pub pretty: bool,
}

#[derive(clap::Args, Debug)]
pub struct ReapArgs {
    /// Staleness threshold in seconds (overrides server.stale_timeout_seconds)
    #[arg(long)]
    pub timeout: Option<u64>,
}
