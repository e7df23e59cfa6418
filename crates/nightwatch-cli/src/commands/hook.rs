//! Hook mode: attach the agent and print effect snapshots.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nightwatch_core::{Config, InjectorBackend, InstrumentationChannel, Snapshot};
use serde_json::json;

use super::install_ctrlc;
use crate::input;
use crate::sink;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run hook mode
pub fn run(config: &Config, json: bool) -> Result<()> {
    let shutdown = install_ctrlc()?;
    let (_keyboard_handle, _keys) = input::spawn_keyboard_monitor(Arc::clone(&shutdown));

    let backend = InjectorBackend::new(config.injector_config());
    let mut channel = InstrumentationChannel::new(Arc::new(backend), config.process_target())
        .with_config(config.channel_config())
        .with_sink(sink::terminal());
    channel.start()?;
    println!("Press Esc or q to quit");

    let mut last_sequence = 0;
    while !shutdown.wait(POLL_INTERVAL) {
        if let Some(snapshot) = channel.snapshot()
            && snapshot.sequence != last_sequence
        {
            last_sequence = snapshot.sequence;
            if json {
                println!("{}", snapshot_json(&snapshot));
            } else {
                println!("{}", format_snapshot(&snapshot));
            }
        }
    }

    channel.stop();
    Ok(())
}

fn format_snapshot(snapshot: &Snapshot) -> String {
    format!(
        "#{} {} buff={:?} debuff={:?}",
        snapshot.sequence,
        snapshot.received_at.format("%H:%M:%S"),
        snapshot.buff,
        snapshot.debuff
    )
}

fn snapshot_json(snapshot: &Snapshot) -> serde_json::Value {
    json!({
        "sequence": snapshot.sequence,
        "received_at": snapshot.received_at.to_rfc3339(),
        "buff": snapshot.buff,
        "debuff": snapshot.debuff,
    })
}
