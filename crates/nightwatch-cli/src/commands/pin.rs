//! Pin mode: hold the configured fields until quit.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::Result;
use nightwatch_core::{Config, SystemProcessProvider, ValuePinner};
use tracing::debug;

use super::{install_ctrlc, wait_for_target};
use crate::input::{self, KeyAction};
use crate::sink;

/// Run pin mode
pub fn run(config: &Config, wait: bool) -> Result<()> {
    let shutdown = install_ctrlc()?;
    let (_keyboard_handle, keys) = input::spawn_keyboard_monitor(Arc::clone(&shutdown));

    if wait && !wait_for_target(config, &shutdown)? {
        return Ok(());
    }

    let mut pinner = ValuePinner::new(
        Arc::new(SystemProcessProvider),
        config.process_target(),
        config.offsets.base_pointer,
        config.pinned_fields(),
    )
    .with_config(config.pinner_config())
    .with_sink(sink::terminal());

    pinner.start()?;
    println!("Press t to toggle pinning, Esc or q to quit");

    while !shutdown.is_stopped() {
        match keys.recv_timeout(Duration::from_millis(100)) {
            Ok(KeyAction::Toggle) => {
                // Failures are already reported through the sink
                if let Err(e) = pinner.toggle() {
                    debug!("Toggle failed: {}", e);
                }
            }
            Ok(KeyAction::Latch) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                shutdown.wait(Duration::from_millis(100));
            }
        }
    }

    pinner.stop();
    Ok(())
}
