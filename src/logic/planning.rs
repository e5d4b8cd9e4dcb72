//! Agent planning
//!
//! Applies the posted levels from the merged decisions to the working
//! state: central-bank levers, bank rates, fiscal settings, the firm's
//! posted price and wage. On the first tick of a day it also settles the
//! education cycle: households that studied yesterday graduate, new
//! enrollments pay tuition to the government and sit out the labor
//! market.

use crate::config::WorldConfig;
use crate::core::TickClock;
use crate::models::{EmploymentStatus, TickDecisions, TickLogEntry};

use super::WorkingState;

pub fn apply_agent_planning(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    config: &WorldConfig,
    clock: TickClock,
) -> Vec<TickLogEntry> {
    let mut logs = Vec::new();

    working.central_bank.policy_rate = decisions.central_bank.policy_rate.clamp(0.0, 0.4);
    working.central_bank.reserve_ratio = decisions.central_bank.reserve_ratio.clamp(0.05, 0.2);

    working.bank.deposit_rate = decisions.bank.deposit_rate;
    working.bank.loan_rate = decisions.bank.loan_rate;

    working.government.tax_rate = decisions.government.tax_rate;
    working.government.bond_issuance_plan = decisions.government.bond_issuance;

    working.firm.price = decisions.firm.price.max(0.1);
    working.firm.wage_offer = decisions.firm.wage_offer.max(0.0);
    working.firm.planned_production = decisions.firm.planned_production.max(0.0);

    if clock.is_first_tick_of_day() {
        logs.push(settle_education(working, decisions, config, clock));
    }

    logs
}

/// Education is a day-scoped commitment: graduation happens at the next
/// day's opening tick, and `is_studying` is only mutable here.
fn settle_education(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    config: &WorldConfig,
    clock: TickClock,
) -> TickLogEntry {
    let gain = config.policies.education_gain;
    let mut graduated = 0u64;
    let mut enrolled = 0u64;
    let mut tuition_total = 0.0;

    let ids: Vec<String> = working.households.keys().cloned().collect();
    for id in ids {
        let household = working.households.get_mut(&id).expect("known id");

        if household.is_studying {
            household.education_level = (household.education_level + gain).min(1.5);
            household.is_studying = false;
            graduated += 1;
        }

        let decision = match decisions.households.get(&id) {
            Some(decision) => decision,
            None => continue,
        };
        if !decision.wants_to_study {
            continue;
        }
        // studying while employed is forbidden
        if household.employment_status != EmploymentStatus::Unemployed {
            continue;
        }
        let tuition = decision.education_payment.max(0.0);
        if tuition > household.balance.cash {
            continue;
        }
        household.balance.cash -= tuition;
        household.is_studying = true;
        working.government.balance.cash += tuition;
        tuition_total += tuition;
        enrolled += 1;
    }

    working
        .log(clock, "education_settled")
        .with("graduated", graduated)
        .with("enrolled", enrolled)
        .with("tuition_paid", tuition_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::baseline_tick_decisions;
    use crate::models::WorldState;

    #[test]
    fn test_enrollment_and_graduation_cycle() {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let mut decisions = baseline_tick_decisions(&world, &config);
        let entry = decisions.households.get_mut("000").unwrap();
        entry.wants_to_study = true;
        entry.education_payment = 10.0;

        let mut working = WorkingState::from_world(&world);
        let gov_cash = working.government.balance.cash;
        let clock = TickClock::for_next_tick(0, 3);
        apply_agent_planning(&mut working, &decisions, &config, clock);

        let h = &working.households["000"];
        assert!(h.is_studying);
        assert!((working.government.balance.cash - gov_cash - 10.0).abs() < 1e-9);

        // next day: graduation, education level grows, flag clears
        let mut decisions_next = baseline_tick_decisions(&world, &config);
        decisions_next.households.get_mut("000").unwrap().wants_to_study = false;
        let clock_next = TickClock::for_next_tick(3, 3);
        apply_agent_planning(&mut working, &decisions_next, &config, clock_next);
        let h = &working.households["000"];
        assert!(!h.is_studying);
        assert!((h.education_level - config.policies.education_gain).abs() < 1e-9);
    }

    #[test]
    fn test_education_capped() {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let decisions = baseline_tick_decisions(&world, &config);
        let mut working = WorkingState::from_world(&world);
        working.households.get_mut("000").unwrap().education_level = 1.49;
        working.households.get_mut("000").unwrap().is_studying = true;
        let clock = TickClock::for_next_tick(0, 3);
        apply_agent_planning(&mut working, &decisions, &config, clock);
        assert!(working.households["000"].education_level <= 1.5);
    }
}
