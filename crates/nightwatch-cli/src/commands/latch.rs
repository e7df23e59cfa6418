//! Latch mode: remember the pinned fields, then put them back on demand.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::Result;
use nightwatch_core::{
    Config, FieldLatch, FieldReader, LatchAction, StatusSink, SystemProcessProvider,
};

use super::{install_ctrlc, wait_for_target};
use crate::input::{self, KeyAction};
use crate::sink;

const SOURCE: &str = "latch";

/// Run latch mode
pub fn run(config: &Config, wait: bool) -> Result<()> {
    let shutdown = install_ctrlc()?;
    let (_keyboard_handle, keys) = input::spawn_keyboard_monitor(Arc::clone(&shutdown));

    if wait && !wait_for_target(config, &shutdown)? {
        return Ok(());
    }

    let mut reader = FieldReader::new(
        Arc::new(SystemProcessProvider),
        config.process_target(),
        config.offsets.base_pointer,
    );
    let mut latches: Vec<FieldLatch> = config
        .pinned_fields()
        .into_iter()
        .map(FieldLatch::new)
        .collect();
    let status = sink::terminal();
    println!("Press l to capture, l again to restore, Esc or q to quit");

    while !shutdown.is_stopped() {
        match keys.recv_timeout(Duration::from_millis(100)) {
            Ok(KeyAction::Latch) => toggle_all(&mut latches, &mut reader, &status),
            Ok(KeyAction::Toggle) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                shutdown.wait(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Toggle every latch once. A failed field is reported and keeps its state.
fn toggle_all(
    latches: &mut [FieldLatch],
    reader: &mut FieldReader<SystemProcessProvider>,
    status: &StatusSink,
) {
    for latch in latches.iter_mut() {
        match latch.toggle(reader) {
            Ok(action) => status.info(SOURCE, describe(&latch.field().name, action)),
            Err(e) => status.error(SOURCE, format!("{}: {}", latch.field().name, e)),
        }
    }
}

fn describe(field: &str, action: LatchAction) -> String {
    match action {
        LatchAction::Captured(value) => format!("Captured {field} = {value}"),
        LatchAction::Restored(value) => format!("Restored {field} = {value}"),
    }
}
