//! State update commands
//!
//! Logic modules never touch the store directly; they emit
//! `StateUpdateCommand`s, the only vocabulary for mutating a world. A
//! command either overwrites one leaf (`Assign`) or increments a numeric
//! leaf (`Delta`). The store applies a batch all-or-nothing against the
//! cached world document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::world::AgentKind;

/// Which sub-document of the world a command addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum UpdateScope {
    Household(String),
    Firm,
    Bank,
    CentralBank,
    Government,
    Macro,
    /// Top-level fields (tick, day).
    World,
}

impl UpdateScope {
    pub fn for_agent(kind: AgentKind, entity_id: &str) -> Self {
        match kind {
            AgentKind::Household => UpdateScope::Household(entity_id.to_string()),
            AgentKind::Firm => UpdateScope::Firm,
            AgentKind::Bank => UpdateScope::Bank,
            AgentKind::CentralBank => UpdateScope::CentralBank,
            AgentKind::Government => UpdateScope::Government,
        }
    }
}

/// The two mutation modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum UpdateOp {
    /// Overwrite the leaf with a JSON value.
    Assign(Value),
    /// Add to a numeric leaf (missing leaf treated as 0).
    Delta(f64),
}

/// A single leaf mutation against the world document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateCommand {
    pub scope: UpdateScope,
    /// Dot-separated path below the scope, e.g. `balance.cash`.
    pub path: String,
    pub op: UpdateOp,
}

impl StateUpdateCommand {
    pub fn assign(scope: UpdateScope, path: &str, value: impl Into<Value>) -> Self {
        Self {
            scope,
            path: path.to_string(),
            op: UpdateOp::Assign(value.into()),
        }
    }

    pub fn delta(scope: UpdateScope, path: &str, amount: f64) -> Self {
        Self {
            scope,
            path: path.to_string(),
            op: UpdateOp::Delta(amount),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum UpdateError {
    #[error("household {0} not found in world document")]
    UnknownHousehold(String),
    #[error("path '{0}' does not resolve to an object")]
    BadPath(String),
    #[error("delta applied to non-numeric leaf '{0}'")]
    NonNumericLeaf(String),
}

/// Apply one command to a world JSON document in place.
///
/// Callers that need atomicity apply the whole batch to a clone and only
/// swap it in when every command succeeded.
pub fn apply_command(doc: &mut Value, command: &StateUpdateCommand) -> Result<(), UpdateError> {
    let container = match &command.scope {
        UpdateScope::Household(id) => doc
            .get_mut("households")
            .and_then(|h| h.get_mut(id.as_str()))
            .ok_or_else(|| UpdateError::UnknownHousehold(id.clone()))?,
        UpdateScope::Firm => &mut doc["firm"],
        UpdateScope::Bank => &mut doc["bank"],
        UpdateScope::CentralBank => &mut doc["central_bank"],
        UpdateScope::Government => &mut doc["government"],
        UpdateScope::Macro => &mut doc["macro_state"],
        UpdateScope::World => doc,
    };

    let mut cursor = container;
    let segments: Vec<&str> = command.path.split('.').collect();
    for segment in &segments[..segments.len() - 1] {
        let obj = cursor
            .as_object_mut()
            .ok_or_else(|| UpdateError::BadPath(command.path.clone()))?;
        cursor = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    let leaf = *segments.last().expect("path is never empty");
    let obj = cursor
        .as_object_mut()
        .ok_or_else(|| UpdateError::BadPath(command.path.clone()))?;

    match &command.op {
        UpdateOp::Assign(value) => {
            obj.insert(leaf.to_string(), value.clone());
        }
        UpdateOp::Delta(amount) => {
            let base = match obj.get(leaf) {
                None | Some(Value::Null) => 0.0,
                Some(v) => v
                    .as_f64()
                    .ok_or_else(|| UpdateError::NonNumericLeaf(command.path.clone()))?,
            };
            let next = base + amount;
            obj.insert(
                leaf.to_string(),
                Value::from(serde_json::Number::from_f64(next).unwrap_or_else(|| 0.into())),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::models::world::WorldState;

    fn world_doc() -> Value {
        let world = WorldState::initial("sim-1", &WorldConfig::default());
        serde_json::to_value(world).unwrap()
    }

    #[test]
    fn test_assign_overwrites_leaf() {
        let mut doc = world_doc();
        let cmd = StateUpdateCommand::assign(UpdateScope::Firm, "price", 12.5);
        apply_command(&mut doc, &cmd).unwrap();
        assert_eq!(doc["firm"]["price"].as_f64().unwrap(), 12.5);
    }

    #[test]
    fn test_delta_increments_nested_leaf() {
        let mut doc = world_doc();
        let before = doc["households"]["000"]["balance"]["cash"].as_f64().unwrap();
        let cmd = StateUpdateCommand::delta(
            UpdateScope::Household("000".into()),
            "balance.cash",
            -25.0,
        );
        apply_command(&mut doc, &cmd).unwrap();
        let after = doc["households"]["000"]["balance"]["cash"].as_f64().unwrap();
        assert!((after - (before - 25.0)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_household_is_rejected() {
        let mut doc = world_doc();
        let cmd = StateUpdateCommand::delta(
            UpdateScope::Household("999".into()),
            "balance.cash",
            1.0,
        );
        assert_eq!(
            apply_command(&mut doc, &cmd),
            Err(UpdateError::UnknownHousehold("999".into()))
        );
    }

    #[test]
    fn test_delta_on_string_leaf_is_rejected() {
        let mut doc = world_doc();
        let cmd = StateUpdateCommand::delta(UpdateScope::Firm, "id", 1.0);
        assert!(matches!(
            apply_command(&mut doc, &cmd),
            Err(UpdateError::NonNumericLeaf(_))
        ));
    }

    #[test]
    fn test_world_scope_sets_tick_and_day() {
        let mut doc = world_doc();
        apply_command(
            &mut doc,
            &StateUpdateCommand::assign(UpdateScope::World, "tick", 6),
        )
        .unwrap();
        apply_command(
            &mut doc,
            &StateUpdateCommand::assign(UpdateScope::World, "day", 2),
        )
        .unwrap();
        assert_eq!(doc["tick"].as_u64().unwrap(), 6);
        assert_eq!(doc["day"].as_u64().unwrap(), 2);
    }
}
