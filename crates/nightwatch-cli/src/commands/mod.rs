//! CLI command implementations.

pub mod fields;
pub mod hook;
pub mod latch;
pub mod pin;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nightwatch_core::{Config, OpenMode, StopSignal, SystemProcessProvider, open_process};
use nightwatch_core::memory::layout::timing;
use tracing::info;

/// Poll interval while waiting for the game to start
pub const PROCESS_POLL: Duration = Duration::from_millis(timing::PROCESS_POLL_MS);

/// Stop signal triggered by Ctrl+C.
pub fn install_ctrlc() -> Result<Arc<StopSignal>> {
    let shutdown = Arc::new(StopSignal::new());
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        shutdown_ctrlc.trigger();
    })?;
    Ok(shutdown)
}

/// Block until the game is running. Returns `false` if interrupted.
pub fn wait_for_target(config: &Config, shutdown: &StopSignal) -> Result<bool> {
    println!("Waiting for {}... (Ctrl+C to quit)", config.process_name);
    let process = open_process(
        &SystemProcessProvider,
        &config.process_target(),
        OpenMode::Wait {
            poll: PROCESS_POLL,
        },
        shutdown,
    )?;
    Ok(process.is_some())
}
