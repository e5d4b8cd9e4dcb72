//! Agent settlement
//!
//! End-of-pipeline bookkeeping. On the first tick of a day: wage payment
//! for firm and government employees, unemployment benefits, and income
//! tax on wages. Every tick: deposit interest accrual at the per-tick
//! rate derived from the annual deposit rate by
//! `(1 + r)^(1 / (ticks_per_day × 365)) − 1`.

use crate::config::WorldConfig;
use crate::core::TickClock;
use crate::models::{EmploymentStatus, TickDecisions, TickLogEntry};

use super::{TickMetrics, WorkingState};

pub fn settle_agents(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    config: &WorldConfig,
    clock: TickClock,
    metrics: &mut TickMetrics,
) -> Vec<TickLogEntry> {
    let mut logs = Vec::new();
    if clock.is_first_tick_of_day() {
        logs.push(pay_wages_and_benefits(working, decisions, config, clock, metrics));
        logs.push(collect_taxes(working, decisions, clock, metrics));
    }
    logs.push(accrue_deposit_interest(working, config, clock));
    logs
}

fn pay_wages_and_benefits(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    config: &WorldConfig,
    clock: TickClock,
    metrics: &mut TickMetrics,
) -> TickLogEntry {
    let wage = decisions.firm.wage_offer;

    let mut firm_payroll = 0.0;
    for id in working.firm.employees.clone() {
        if let Some(household) = working.households.get_mut(&id) {
            household.balance.cash += wage;
            household.wage_income = wage;
            firm_payroll += wage;
        }
    }
    working.firm.balance.cash = (working.firm.balance.cash - firm_payroll).max(0.0);

    let gov_wage = wage * 0.8;
    let mut gov_payroll = 0.0;
    for id in working.government.employees.clone() {
        if let Some(household) = working.households.get_mut(&id) {
            household.balance.cash += gov_wage;
            household.wage_income = gov_wage;
            gov_payroll += gov_wage;
        }
    }

    let benefit = config.policies.unemployment_benefit;
    let mut benefits_total = 0.0;
    for household in working.households.values_mut() {
        if household.employment_status == EmploymentStatus::Unemployed {
            household.balance.cash += benefit;
            household.wage_income = 0.0;
            benefits_total += benefit;
        }
    }
    working.government.balance.cash =
        (working.government.balance.cash - gov_payroll - benefits_total).max(0.0);

    metrics.wage_payments_firm = firm_payroll;
    metrics.wage_payments_government = gov_payroll;
    metrics.transfers = benefits_total;

    working
        .log(clock, "wages_disbursed")
        .with("firm_payroll", firm_payroll)
        .with("government_payroll", gov_payroll)
        .with("benefits", benefits_total)
}

fn collect_taxes(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    clock: TickClock,
    metrics: &mut TickMetrics,
) -> TickLogEntry {
    let tax_rate = decisions.government.tax_rate;
    let mut total_tax = 0.0;
    for household in working.households.values_mut() {
        let taxable = household.wage_income.max(0.0);
        let tax = taxable * tax_rate;
        if tax <= 0.0 {
            continue;
        }
        let deduction = tax.min(household.balance.cash);
        household.balance.cash -= deduction;
        total_tax += deduction;
    }
    working.government.balance.cash += total_tax;
    metrics.taxes = total_tax;

    working
        .log(clock, "taxes_collected")
        .with("tax_collected", total_tax)
        .with("tax_rate", tax_rate)
}

fn accrue_deposit_interest(
    working: &mut WorkingState,
    config: &WorldConfig,
    clock: TickClock,
) -> TickLogEntry {
    let per_tick_rate = config.per_tick_interest(working.bank.deposit_rate);
    let mut interest_total = 0.0;
    for household in working.households.values_mut() {
        if household.balance.deposits <= 0.0 {
            continue;
        }
        let interest = household.balance.deposits * per_tick_rate;
        household.balance.deposits += interest;
        interest_total += interest;
    }
    // credited deposits are a matching liability on the bank's book
    working.bank.deposits += interest_total;

    working
        .log(clock, "interest_accrued")
        .with("total_interest", interest_total)
        .with("per_tick_rate", per_tick_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::baseline_tick_decisions;
    use crate::models::WorldState;

    fn setup() -> (WorkingState, TickDecisions, WorldConfig) {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let decisions = baseline_tick_decisions(&world, &config);
        (WorkingState::from_world(&world), decisions, config)
    }

    #[test]
    fn test_wages_paid_only_on_first_tick_of_day() {
        let (mut working, decisions, config) = setup();
        // employ a household manually
        {
            let h = working.households.get_mut("000").unwrap();
            h.employment_status = EmploymentStatus::EmployedFirm;
            h.employer_id = Some("firm_1".to_string());
        }
        working.firm.employees = vec!["000".to_string()];

        let cash_before = working.households["000"].balance.cash;
        let mut metrics = TickMetrics::default();
        // tick 2 of the day: no wages
        settle_agents(
            &mut working,
            &decisions,
            &config,
            TickClock::for_next_tick(1, 3),
            &mut metrics,
        );
        assert_eq!(metrics.wage_payments_firm, 0.0);
        assert_eq!(working.households["000"].balance.cash, cash_before);

        // first tick of a day: wage lands
        let mut metrics = TickMetrics::default();
        settle_agents(
            &mut working,
            &decisions,
            &config,
            TickClock::for_next_tick(3, 3),
            &mut metrics,
        );
        assert!(metrics.wage_payments_firm > 0.0);
        assert!(working.households["000"].balance.cash > cash_before);
    }

    #[test]
    fn test_unemployed_receive_benefits_and_pay_no_tax() {
        let (mut working, decisions, config) = setup();
        let cash_before = working.households["001"].balance.cash;
        let mut metrics = TickMetrics::default();
        settle_agents(
            &mut working,
            &decisions,
            &config,
            TickClock::for_next_tick(0, 3),
            &mut metrics,
        );
        let h = &working.households["001"];
        assert!(h.balance.cash > cash_before);
        assert_eq!(h.wage_income, 0.0);
        assert!(metrics.transfers > 0.0);
        assert_eq!(metrics.taxes, 0.0);
    }

    #[test]
    fn test_interest_accrues_every_tick() {
        let (mut working, decisions, config) = setup();
        let deposits_before = working.households["000"].balance.deposits;
        let mut metrics = TickMetrics::default();
        settle_agents(
            &mut working,
            &decisions,
            &config,
            TickClock::for_next_tick(1, 3),
            &mut metrics,
        );
        assert!(working.households["000"].balance.deposits > deposits_before);
    }

    #[test]
    fn test_per_tick_rate_matches_annual_compounding() {
        let config = WorldConfig::default();
        let per_tick = config.per_tick_interest(0.01);
        let periods = (config.simulation.ticks_per_day * 365) as f64;
        assert!(((1.0 + per_tick).powf(periods) - 1.01).abs() < 1e-9);
    }
}
