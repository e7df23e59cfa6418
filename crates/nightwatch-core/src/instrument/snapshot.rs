use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Slots reported per list by the agent
pub const MAX_ENTRIES: usize = 3;

/// Marker the game uses for an empty effect slot
const EMPTY_SLOT: u32 = u32::MAX;

/// Active effect ids reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub buff: Vec<u32>,
    #[serde(default)]
    pub debuff: Vec<u32>,
    /// Position in the stream of snapshots received by one channel
    #[serde(skip)]
    pub sequence: u64,
    #[serde(skip, default = "Local::now")]
    pub received_at: DateTime<Local>,
}

impl Snapshot {
    /// Decode an agent `send` payload.
    pub fn from_payload(payload: Value, sequence: u64) -> Result<Self> {
        let mut snapshot: Snapshot = serde_json::from_value(payload)?;
        snapshot.buff = clean(snapshot.buff);
        snapshot.debuff = clean(snapshot.debuff);
        snapshot.sequence = sequence;
        snapshot.received_at = Local::now();
        Ok(snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.buff.is_empty() && self.debuff.is_empty()
    }
}

fn clean(ids: Vec<u32>) -> Vec<u32> {
    ids.into_iter()
        .filter(|&id| id != EMPTY_SLOT)
        .take(MAX_ENTRIES)
        .collect()
}
