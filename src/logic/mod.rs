//! Logic modules
//!
//! Pure market-clearing and evolution functions. Each phase reads the
//! resolved `TickDecisions` and mutates a working copy of the world; the
//! composition at the bottom diffs the working copy against the original
//! snapshot and emits `StateUpdateCommand`s: numeric stocks as atomic
//! deltas, levels and discrete fields as assigns. Nothing here touches
//! the store.
//!
//! Fixed phase order: shock injection → labor market (first tick of day
//! only) → agent planning → production → goods market → finance market →
//! agent settlement → macro statistics.
//!
//! Every source of randomness is a purpose-tagged stream over
//! `(global_seed, tick_index)`, so identical inputs produce identical
//! commands and logs.

pub mod finance;
pub mod goods;
pub mod labor;
pub mod macro_stats;
pub mod planning;
pub mod production;
pub mod settlement;
pub mod shock;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::WorldConfig;
use crate::core::TickClock;
use crate::models::{
    BankState, CentralBankState, FirmState, GovernmentState, HouseholdState, MacroState,
    StateUpdateCommand, TickDecisions, TickLogEntry, UpdateScope, WorldState,
};

/// Mutable working copy of the world threaded through the phases.
#[derive(Debug, Clone)]
pub struct WorkingState {
    pub simulation_id: String,
    pub households: BTreeMap<String, HouseholdState>,
    pub firm: FirmState,
    pub bank: BankState,
    pub central_bank: CentralBankState,
    pub government: GovernmentState,
    pub macro_state: MacroState,
}

impl WorkingState {
    fn from_world(world: &WorldState) -> Self {
        Self {
            simulation_id: world.simulation_id.clone(),
            households: world.households.clone(),
            firm: world.firm.clone(),
            bank: world.bank.clone(),
            central_bank: world.central_bank.clone(),
            government: world.government.clone(),
            macro_state: world.macro_state.clone(),
        }
    }

    pub fn log(&self, clock: TickClock, message: &str) -> TickLogEntry {
        TickLogEntry::new(&self.simulation_id, clock.tick_index(), clock.day(), message)
    }
}

/// Aggregates the phases feed into the macro statistics.
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    pub goods_sold: f64,
    pub consumption_value: f64,
    pub wage_payments_firm: f64,
    pub wage_payments_government: f64,
    pub transfers: f64,
    pub taxes: f64,
    pub coupon_payments: f64,
}

/// Output of one tick's logic run.
pub struct LogicOutcome {
    pub commands: Vec<StateUpdateCommand>,
    pub logs: Vec<TickLogEntry>,
}

/// Run all logic modules in their fixed order.
pub fn execute_tick(
    world: &WorldState,
    decisions: &TickDecisions,
    config: &WorldConfig,
    clock: TickClock,
) -> LogicOutcome {
    let seed = config.simulation.global_rng_seed;
    let mut working = WorkingState::from_world(world);
    let mut metrics = TickMetrics::default();
    let mut logs = Vec::new();

    let ability = if config.features.shock_enabled {
        let (ability, log) = shock::inject_shocks(&mut working, config, clock, seed);
        logs.push(log);
        ability
    } else {
        BTreeMap::new()
    };

    if clock.is_first_tick_of_day() {
        logs.push(labor::clear_labor_market(
            &mut working,
            decisions,
            clock,
            seed,
            &ability,
        ));
    }

    logs.extend(planning::apply_agent_planning(
        &mut working,
        decisions,
        config,
        clock,
    ));

    logs.push(production::run_production(&mut working, decisions, clock));

    logs.push(goods::clear_goods_market(
        &mut working,
        decisions,
        clock,
        seed,
        &mut metrics,
    ));

    logs.extend(finance::clear_finance_market(
        &mut working,
        decisions,
        config,
        clock,
        seed,
        &mut metrics,
    ));

    logs.extend(settlement::settle_agents(
        &mut working,
        decisions,
        config,
        clock,
        &mut metrics,
    ));

    logs.push(macro_stats::update_macro_statistics(
        &mut working,
        clock,
        &metrics,
    ));

    let commands = build_state_updates(world, &working);
    LogicOutcome { commands, logs }
}

// ---------------------------------------------------------------------------
// Diff → command builder
// ---------------------------------------------------------------------------

fn delta_if_changed(
    commands: &mut Vec<StateUpdateCommand>,
    scope: &UpdateScope,
    path: &str,
    before: f64,
    after: f64,
) {
    if (after - before).abs() > 1e-12 {
        commands.push(StateUpdateCommand::delta(scope.clone(), path, after - before));
    }
}

fn assign_if_changed<T: PartialEq + serde::Serialize>(
    commands: &mut Vec<StateUpdateCommand>,
    scope: &UpdateScope,
    path: &str,
    before: &T,
    after: &T,
) {
    if before != after {
        let value = serde_json::to_value(after).unwrap_or(Value::Null);
        commands.push(StateUpdateCommand::assign(scope.clone(), path, value));
    }
}

/// Translate the mutation of the working copy into update commands.
fn build_state_updates(original: &WorldState, working: &WorkingState) -> Vec<StateUpdateCommand> {
    let mut commands = Vec::new();

    for (id, after) in &working.households {
        let before = match original.households.get(id) {
            Some(before) => before,
            None => continue,
        };
        if before == after {
            continue;
        }
        let scope = UpdateScope::Household(id.clone());
        delta_if_changed(&mut commands, &scope, "balance.cash", before.balance.cash, after.balance.cash);
        delta_if_changed(&mut commands, &scope, "balance.deposits", before.balance.deposits, after.balance.deposits);
        delta_if_changed(&mut commands, &scope, "balance.loans", before.balance.loans, after.balance.loans);
        delta_if_changed(&mut commands, &scope, "balance.bond_holdings", before.balance.bond_holdings, after.balance.bond_holdings);
        assign_if_changed(&mut commands, &scope, "skill", &before.skill, &after.skill);
        assign_if_changed(&mut commands, &scope, "education_level", &before.education_level, &after.education_level);
        assign_if_changed(&mut commands, &scope, "employment_status", &before.employment_status, &after.employment_status);
        assign_if_changed(&mut commands, &scope, "employer_id", &before.employer_id, &after.employer_id);
        assign_if_changed(&mut commands, &scope, "is_studying", &before.is_studying, &after.is_studying);
        assign_if_changed(&mut commands, &scope, "wage_income", &before.wage_income, &after.wage_income);
        assign_if_changed(&mut commands, &scope, "last_consumption", &before.last_consumption, &after.last_consumption);
        assign_if_changed(&mut commands, &scope, "reservation_wage", &before.reservation_wage, &after.reservation_wage);
    }

    let scope = UpdateScope::Firm;
    let (before, after) = (&original.firm, &working.firm);
    delta_if_changed(&mut commands, &scope, "balance.cash", before.balance.cash, after.balance.cash);
    delta_if_changed(&mut commands, &scope, "balance.deposits", before.balance.deposits, after.balance.deposits);
    delta_if_changed(&mut commands, &scope, "inventory", before.inventory, after.inventory);
    assign_if_changed(&mut commands, &scope, "price", &before.price, &after.price);
    assign_if_changed(&mut commands, &scope, "wage_offer", &before.wage_offer, &after.wage_offer);
    assign_if_changed(&mut commands, &scope, "planned_production", &before.planned_production, &after.planned_production);
    assign_if_changed(&mut commands, &scope, "capital_stock", &before.capital_stock, &after.capital_stock);
    assign_if_changed(&mut commands, &scope, "productivity", &before.productivity, &after.productivity);
    assign_if_changed(&mut commands, &scope, "employees", &before.employees, &after.employees);
    assign_if_changed(&mut commands, &scope, "last_sales", &before.last_sales, &after.last_sales);

    let scope = UpdateScope::Bank;
    let (before, after) = (&original.bank, &working.bank);
    delta_if_changed(&mut commands, &scope, "reserves", before.reserves, after.reserves);
    delta_if_changed(&mut commands, &scope, "deposits", before.deposits, after.deposits);
    delta_if_changed(&mut commands, &scope, "bond_holdings", before.bond_holdings, after.bond_holdings);
    assign_if_changed(&mut commands, &scope, "loans", &before.loans, &after.loans);
    assign_if_changed(&mut commands, &scope, "deposit_rate", &before.deposit_rate, &after.deposit_rate);
    assign_if_changed(&mut commands, &scope, "loan_rate", &before.loan_rate, &after.loan_rate);

    let scope = UpdateScope::CentralBank;
    let (before, after) = (&original.central_bank, &working.central_bank);
    assign_if_changed(&mut commands, &scope, "policy_rate", &before.policy_rate, &after.policy_rate);
    assign_if_changed(&mut commands, &scope, "reserve_ratio", &before.reserve_ratio, &after.reserve_ratio);

    let scope = UpdateScope::Government;
    let (before, after) = (&original.government, &working.government);
    delta_if_changed(&mut commands, &scope, "balance.cash", before.balance.cash, after.balance.cash);
    delta_if_changed(&mut commands, &scope, "outstanding_debt", before.outstanding_debt, after.outstanding_debt);
    assign_if_changed(&mut commands, &scope, "tax_rate", &before.tax_rate, &after.tax_rate);
    assign_if_changed(&mut commands, &scope, "spending", &before.spending, &after.spending);
    assign_if_changed(&mut commands, &scope, "unemployment_benefit", &before.unemployment_benefit, &after.unemployment_benefit);
    assign_if_changed(&mut commands, &scope, "employees", &before.employees, &after.employees);
    assign_if_changed(&mut commands, &scope, "bond_issuance_plan", &before.bond_issuance_plan, &after.bond_issuance_plan);

    let scope = UpdateScope::Macro;
    let (before, after) = (&original.macro_state, &working.macro_state);
    assign_if_changed(&mut commands, &scope, "gdp", &before.gdp, &after.gdp);
    assign_if_changed(&mut commands, &scope, "inflation", &before.inflation, &after.inflation);
    assign_if_changed(&mut commands, &scope, "unemployment_rate", &before.unemployment_rate, &after.unemployment_rate);
    assign_if_changed(&mut commands, &scope, "price_index", &before.price_index, &after.price_index);
    assign_if_changed(&mut commands, &scope, "wage_index", &before.wage_index, &after.wage_index);

    commands
}
