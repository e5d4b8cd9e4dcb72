//! Context trimming (visibility policy)
//!
//! Builds the per-binding context a sandboxed script receives. The
//! trimmed context is the only channel through which script code sees
//! world data:
//!
//! - household bindings see their own record, the macro aggregates and
//!   the public market fields, and never another household's state;
//! - singleton bindings see their own record plus the same shared data;
//! - every binding sees tick, day, feature flags and the economic
//!   configuration (sandbox and store internals are withheld).

use serde_json::{json, Value};

use crate::config::WorldConfig;
use crate::models::{AgentKind, WorldState};

/// Script wire-contract version delivered in every context.
pub const SCRIPT_API_VERSION: u32 = 1;

/// Build the trimmed context for one binding, or `None` when the entity
/// does not exist in this world.
pub fn trim_context(
    world: &WorldState,
    config: &WorldConfig,
    kind: AgentKind,
    entity_id: &str,
) -> Option<Value> {
    let entity_state = match kind {
        AgentKind::Household => serde_json::to_value(world.households.get(entity_id)?).ok()?,
        AgentKind::Firm => serde_json::to_value(&world.firm).ok()?,
        AgentKind::Bank => serde_json::to_value(&world.bank).ok()?,
        AgentKind::CentralBank => serde_json::to_value(&world.central_bank).ok()?,
        AgentKind::Government => serde_json::to_value(&world.government).ok()?,
    };

    let world_view = json!({
        "simulation_id": world.simulation_id,
        "tick": world.tick,
        "day": world.day,
        "macro": world.macro_state,
        "market": world.public_market_data(),
    });

    let config_view = json!({
        "simulation": config.simulation,
        "markets": config.markets,
        "policies": config.policies,
    });

    Some(json!({
        "world_state": world_view,
        "entity_state": entity_state,
        "config": config_view,
        "features": config.features,
        "script_api_version": SCRIPT_API_VERSION,
        "agent_kind": kind.as_str(),
        "entity_id": entity_id,
    }))
}
