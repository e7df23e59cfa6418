//! One-shot field access.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use nightwatch_core::{Config, FieldReader, SystemProcessProvider};

use super::{install_ctrlc, wait_for_target};

fn reader(config: &Config) -> FieldReader<SystemProcessProvider> {
    FieldReader::new(
        Arc::new(SystemProcessProvider),
        config.process_target(),
        config.offsets.base_pointer,
    )
}

/// Wait for the game if requested. Returns `false` if interrupted.
fn ensure_target(config: &Config, wait: bool) -> Result<bool> {
    if !wait {
        return Ok(true);
    }
    let shutdown = install_ctrlc()?;
    wait_for_target(config, &shutdown)
}

/// Print every configured field
pub fn read(config: &Config, wait: bool) -> Result<()> {
    if !ensure_target(config, wait)? {
        return Ok(());
    }
    let mut reader = reader(config);

    for field in &config.offsets.fields {
        match reader.get(field) {
            Ok(value) => println!("{:<12} {}", field.name, value),
            Err(e) if e.is_not_found() => return Err(e.into()),
            Err(e) => println!("{:<12} unavailable ({})", field.name, e),
        }
    }
    Ok(())
}

/// Write one field
pub fn set(config: &Config, name: &str, value: i64, wait: bool) -> Result<()> {
    let field = config
        .field(name)
        .ok_or_else(|| anyhow!("Unknown field '{}'", name))?;
    if !ensure_target(config, wait)? {
        return Ok(());
    }

    reader(config).set(field, value)?;
    println!("{} = {}", field.name, value);
    Ok(())
}
