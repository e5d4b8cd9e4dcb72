//! Tick log entries
//!
//! Append-only structured records of what happened inside a tick. Kept
//! free of wall-clock fields so that two runs from the same state produce
//! byte-identical logs; the durable tier stamps `recorded_at` at insert.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickLogEntry {
    pub simulation_id: String,
    pub tick: u64,
    pub day: u64,
    pub message: String,
    pub context: BTreeMap<String, Value>,
}

impl TickLogEntry {
    pub fn new(simulation_id: &str, tick: u64, day: u64, message: &str) -> Self {
        Self {
            simulation_id: simulation_id.to_string(),
            tick,
            day,
            message: message.to_string(),
            context: BTreeMap::new(),
        }
    }

    /// Attach one structured context field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}
