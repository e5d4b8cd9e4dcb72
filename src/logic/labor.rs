//! Labor market clearing
//!
//! Runs on the first tick of each day. Unemployed households offering
//! labor (and not studying) are scored with
//! `0.8 × normalized productivity + 0.2 × noise`, where the noise for a
//! candidate is drawn from a stream over
//! `(global_seed, tick_index, agent_id)` so it does not depend on how
//! many other candidates exist. The firm hires the top candidates up to
//! its hiring demand; the government fills its job target from the
//! remainder at 0.8 × the firm wage. Ties break by score, then by
//! ascending agent id.

use std::collections::BTreeMap;

use crate::core::TickClock;
use crate::models::{EmploymentStatus, TickDecisions, TickLogEntry};
use crate::rng::RngStream;

use super::WorkingState;

pub fn clear_labor_market(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    clock: TickClock,
    seed: u64,
    ability: &BTreeMap<String, f64>,
) -> TickLogEntry {
    let wage_offer = decisions.firm.wage_offer;

    // candidate pool: unemployed, offering labor, not studying, and not
    // priced out by their reservation wage
    let mut candidates: Vec<(String, f64)> = Vec::new();
    for (id, household) in &working.households {
        let decision = match decisions.households.get(id) {
            Some(decision) => decision,
            None => continue,
        };
        if decision.labor_supply <= 0.0 {
            continue;
        }
        if household.is_studying {
            continue;
        }
        if household.employment_status != EmploymentStatus::Unemployed {
            continue;
        }
        if household.reservation_wage > wage_offer * 1.1 {
            continue;
        }
        let productivity = household.skill * ability.get(id).copied().unwrap_or(1.0);
        candidates.push((id.clone(), productivity));
    }

    let max_productivity = candidates
        .iter()
        .map(|(_, p)| *p)
        .fold(f64::MIN_POSITIVE, f64::max);

    let mut scored: Vec<(String, f64)> = candidates
        .into_iter()
        .map(|(id, productivity)| {
            let noise = RngStream::for_agent(seed, clock.tick_index(), "labor", &id).next_f64();
            let score = 0.8 * (productivity / max_productivity) + 0.2 * noise;
            (id, score)
        })
        .collect();
    // descending by score; ids ascending for equal scores
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let firm_slots = decisions.firm.hiring_demand as usize;
    let hired_firm: Vec<String> = scored.iter().take(firm_slots).map(|(id, _)| id.clone()).collect();

    let gov_target = decisions.government.government_jobs as usize;
    let gov_open = gov_target.saturating_sub(working.government.employees.len());
    let hired_gov: Vec<String> = scored
        .iter()
        .skip(firm_slots)
        .take(gov_open)
        .map(|(id, _)| id.clone())
        .collect();

    let firm_id = working.firm.id.clone();
    for id in &hired_firm {
        let household = working.households.get_mut(id).expect("candidate exists");
        household.employment_status = EmploymentStatus::EmployedFirm;
        household.employer_id = Some(firm_id.clone());
        household.wage_income = wage_offer;
    }
    let government_id = working.government.id.clone();
    for id in &hired_gov {
        let household = working.households.get_mut(id).expect("candidate exists");
        household.employment_status = EmploymentStatus::EmployedGovernment;
        household.employer_id = Some(government_id.clone());
        household.wage_income = wage_offer * 0.8;
    }

    // keep the derived employee lists in lockstep with employer_id; both
    // sides land in the same atomic update batch
    let mut firm_employees = working.firm.employees.clone();
    firm_employees.extend(hired_firm.iter().cloned());
    firm_employees.sort();
    firm_employees.dedup();
    working.firm.employees = firm_employees;

    let mut gov_employees = working.government.employees.clone();
    gov_employees.extend(hired_gov.iter().cloned());
    gov_employees.sort();
    gov_employees.dedup();
    working.government.employees = gov_employees;

    working
        .log(clock, "labor_market_cleared")
        .with("firm_headcount", working.firm.employees.len() as u64)
        .with(
            "government_headcount",
            working.government.employees.len() as u64,
        )
        .with("hired_firm", hired_firm.len() as u64)
        .with("hired_government", hired_gov.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::fallback::baseline_tick_decisions;
    use crate::models::WorldState;

    fn setup() -> (WorkingState, TickDecisions, WorldConfig) {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let decisions = baseline_tick_decisions(&world, &config);
        (WorkingState::from_world(&world), decisions, config)
    }

    #[test]
    fn test_hiring_respects_demand() {
        let (mut working, mut decisions, _config) = setup();
        decisions.firm.hiring_demand = 5;
        decisions.government.government_jobs = 0;
        let clock = TickClock::for_next_tick(0, 3);
        clear_labor_market(&mut working, &decisions, clock, 42, &BTreeMap::new());
        assert_eq!(working.firm.employees.len(), 5);
        for id in &working.firm.employees {
            let h = &working.households[id];
            assert_eq!(h.employment_status, EmploymentStatus::EmployedFirm);
            assert_eq!(h.employer_id.as_deref(), Some("firm_1"));
        }
    }

    #[test]
    fn test_matching_is_deterministic() {
        let (working, mut decisions, _config) = setup();
        decisions.firm.hiring_demand = 10;
        let clock = TickClock::for_next_tick(0, 3);

        let mut a = working.clone();
        let mut b = working.clone();
        clear_labor_market(&mut a, &decisions, clock, 42, &BTreeMap::new());
        clear_labor_market(&mut b, &decisions, clock, 42, &BTreeMap::new());
        assert_eq!(a.firm.employees, b.firm.employees);
    }

    #[test]
    fn test_studying_households_are_skipped() {
        let (mut working, mut decisions, _config) = setup();
        decisions.firm.hiring_demand = working.households.len() as u64;
        decisions.government.government_jobs = 0;
        working.households.get_mut("000").unwrap().is_studying = true;
        let clock = TickClock::for_next_tick(0, 3);
        clear_labor_market(&mut working, &decisions, clock, 42, &BTreeMap::new());
        assert!(!working.firm.employees.contains(&"000".to_string()));
    }

    #[test]
    fn test_government_hires_from_remainder() {
        let (mut working, mut decisions, _config) = setup();
        decisions.firm.hiring_demand = 3;
        decisions.government.government_jobs = 4;
        let clock = TickClock::for_next_tick(0, 3);
        clear_labor_market(&mut working, &decisions, clock, 42, &BTreeMap::new());
        assert_eq!(working.firm.employees.len(), 3);
        assert_eq!(working.government.employees.len(), 4);
        for id in &working.government.employees {
            assert!(!working.firm.employees.contains(id));
        }
    }
}
