//! Production phase
//!
//! The firm produces up to its labor capacity and stocks inventory.
//! Capacity is `max(1, employees) × max(productivity, 0.1)` so a fresh
//! world with no hires still trickles out goods.

use crate::core::TickClock;
use crate::models::{TickDecisions, TickLogEntry};

use super::WorkingState;

pub fn run_production(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    clock: TickClock,
) -> TickLogEntry {
    let firm = &mut working.firm;
    let capacity = (firm.employees.len().max(1)) as f64 * firm.productivity.max(0.1);
    let produced = decisions.firm.planned_production.clamp(0.0, capacity);
    firm.inventory = (firm.inventory + produced).max(0.0);

    working
        .log(clock, "production_phase_completed")
        .with("produced_goods", produced)
        .with("inventory", working.firm.inventory)
        .with("capacity", capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::fallback::baseline_tick_decisions;
    use crate::models::WorldState;

    #[test]
    fn test_production_capped_by_capacity() {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let mut decisions = baseline_tick_decisions(&world, &config);
        decisions.firm.planned_production = 1_000_000.0;

        let mut working = WorkingState::from_world(&world);
        let inventory_before = working.firm.inventory;
        let clock = TickClock::for_next_tick(0, 3);
        run_production(&mut working, &decisions, clock);

        let capacity = working.firm.productivity.max(0.1); // no employees yet
        assert!((working.firm.inventory - inventory_before - capacity).abs() < 1e-9);
    }
}
