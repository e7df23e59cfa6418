use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nightwatch")]
#[command(about = "NIGHTREIGN value pinner and effect monitor")]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON); built-in defaults are used if it is missing
    #[arg(short, long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// Wait for the game to start instead of failing immediately
    #[arg(short, long, global = true)]
    pub wait: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Hold the pinned fields at their current values until quit (t toggles)
    Pin,
    /// Capture the pinned fields on l, write them back on the next l
    Latch,
    /// Attach the agent and print active effects as they change
    Hook {
        /// Print each snapshot as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Print every configured field once
    Read,
    /// Write one field
    Set {
        /// Field name from the configuration, e.g. anhen
        field: String,
        /// New value (must not be negative)
        value: i64,
    },
}
