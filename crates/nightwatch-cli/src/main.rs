mod cli;
mod commands;
mod input;
mod sink;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use nightwatch_core::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nightwatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Pin => commands::pin::run(&config, cli.wait),
        Command::Latch => commands::latch::run(&config, cli.wait),
        Command::Hook { json } => commands::hook::run(&config, json),
        Command::Read => commands::fields::read(&config, cli.wait),
        Command::Set { field, value } => commands::fields::set(&config, &field, value, cli.wait),
    }
}

/// Load the configuration, falling back to defaults only if the file is absent.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("{} not found, using built-in defaults", path.display());
        return Ok(Config::default());
    }
    let config = Config::load(path)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}
