//! Baseline fallback strategies
//!
//! Deterministic built-in decision rules, one per agent kind. They cover
//! agents that have no bound script (when the simulation permits it) and
//! agents whose script failed or returned an invalid override. Outputs
//! flow through the same decision merger as script output, tagged with
//! `DecisionSource::Baseline`.

use std::collections::BTreeMap;

use crate::config::WorldConfig;
use crate::models::{
    BankDecision, BankState, CentralBankDecision, CentralBankState, EmploymentStatus,
    FirmDecision, FirmState, GovernmentDecision, GovernmentState, HouseholdDecision,
    HouseholdState, PublicMarketData, TickDecisions, WorldState,
};

/// Simple consumption-savings rule for households.
///
/// Consume subsistence plus a fixed share of discretionary income, save a
/// flat slice of the rest, offer full labor while unemployed. Withdraw
/// from deposits only to cover a subsistence shortfall.
pub fn household_decision(
    household: &HouseholdState,
    market: &PublicMarketData,
    config: &WorldConfig,
) -> HouseholdDecision {
    let available_income = household.balance.cash + household.wage_income;
    let subsistence_cost =
        config.markets.goods.subsistence_consumption * market.goods_price.max(0.1);
    let discretionary = (available_income - subsistence_cost).max(0.0);
    let planned_consumption = (subsistence_cost + discretionary * 0.3).min(available_income);

    let savings_rate = if available_income > subsistence_cost * 1.5 {
        0.3
    } else {
        0.2
    };

    let labor_supply = if household.employment_status == EmploymentStatus::Unemployed {
        1.0
    } else {
        0.8
    };

    let withdrawal = (subsistence_cost - household.balance.cash)
        .max(0.0)
        .min(household.balance.deposits);

    HouseholdDecision {
        labor_supply,
        consumption_budget: planned_consumption,
        goods_limit_price: market.goods_price,
        savings_rate,
        withdrawal,
        loan_request_amount: 0.0,
        loan_request_rate: market.loan_rate,
        bond_bid: 0.0,
        education_payment: 0.0,
        wants_to_study: false,
    }
}

/// Firm adjusts production and wage offers based on recent sales.
pub fn firm_decision(firm: &FirmState, config: &WorldConfig) -> FirmDecision {
    let target_inventory = config.simulation.num_households as f64
        * config.markets.goods.subsistence_consumption;
    let inventory_gap = target_inventory - firm.inventory;
    let expected_demand = target_inventory.max(firm.last_sales * 1.1);
    let planned_production = (expected_demand + inventory_gap).max(0.0);

    let effective_productivity = firm.productivity.max(0.1);
    let desired_workers = (planned_production / effective_productivity).ceil() as i64;
    let hiring_demand = (desired_workers - firm.employees.len() as i64).max(0) as u64;

    let price_adjustment = if firm.inventory < target_inventory * 0.8 {
        1.05
    } else if firm.inventory > target_inventory * 1.2 {
        0.97
    } else {
        1.0
    };
    let price = (firm.price * price_adjustment)
        .clamp(0.5 * firm.price, 2.0 * firm.price)
        .max(0.1);

    let wage_offer = (config.markets.labor.base_wage * (1.0 + hiring_demand as f64 * 0.01))
        .clamp(50.0, 200.0);

    FirmDecision {
        price,
        planned_production,
        wage_offer,
        hiring_demand,
    }
}

/// Government keeps the tax rate near the policy setting and leans
/// against unemployment with public jobs and transfers. Bond issuance
/// covers the projected benefit bill the treasury cannot pay from cash.
pub fn government_decision(
    government: &GovernmentState,
    unemployment_rate: f64,
    config: &WorldConfig,
) -> GovernmentDecision {
    let target_tax = config.policies.tax_rate;
    let tax_rate = (0.5 * government.tax_rate + 0.5 * target_tax).clamp(0.05, 0.6);

    let unemployment_gap = (unemployment_rate - 0.07).max(0.0);
    let additional_jobs =
        (unemployment_gap * config.simulation.num_households as f64 * 0.2).round() as u64;
    let government_jobs = config
        .markets
        .labor
        .government_jobs
        .max(government.employees.len() as u64 + additional_jobs);

    let transfer_budget = config.policies.unemployment_benefit
        * config.simulation.num_households as f64
        * unemployment_gap;

    let projected_benefits =
        government.unemployment_benefit * config.simulation.num_households as f64 * unemployment_rate;
    let bond_issuance = (projected_benefits - government.balance.cash).max(0.0);

    GovernmentDecision {
        tax_rate,
        government_jobs,
        transfer_budget,
        bond_issuance,
    }
}

/// Bank prices loans as a spread over the policy rate and lends out of
/// deposits not locked up by the reserve requirement.
pub fn bank_decision(bank: &BankState, central_bank: &CentralBankState) -> BankDecision {
    let policy_rate = central_bank.policy_rate;
    let loan_rate = (policy_rate + 0.03).clamp(0.02, 0.25);
    let deposit_rate = (policy_rate * 0.6).clamp(0.0, loan_rate - 0.005);

    let outstanding: f64 = bank.loans.values().sum();
    let loanable_funds =
        (bank.deposits * (1.0 - central_bank.reserve_ratio) - outstanding).max(0.0);

    BankDecision {
        deposit_rate,
        loan_rate,
        loan_supply: loanable_funds,
    }
}

/// Taylor-rule style adjustment of the policy rate.
pub fn central_bank_decision(
    central_bank: &CentralBankState,
    market: &PublicMarketData,
) -> CentralBankDecision {
    let inflation_gap = market.inflation - central_bank.inflation_target;
    let unemployment_gap = market.unemployment_rate - central_bank.unemployment_target;

    let policy_rate =
        (central_bank.policy_rate + 0.5 * inflation_gap - 0.3 * unemployment_gap).clamp(0.0, 0.4);
    let reserve_ratio =
        (central_bank.reserve_ratio + 0.1 * unemployment_gap).clamp(0.05, 0.2);

    CentralBankDecision {
        policy_rate,
        reserve_ratio,
    }
}

/// Full baseline decision set for one tick.
pub fn baseline_tick_decisions(world: &WorldState, config: &WorldConfig) -> TickDecisions {
    let market = world.public_market_data();

    let mut households = BTreeMap::new();
    for (id, household) in &world.households {
        households.insert(id.clone(), household_decision(household, &market, config));
    }

    TickDecisions {
        households,
        firm: firm_decision(&world.firm, config),
        bank: bank_decision(&world.bank, &world.central_bank),
        government: government_decision(
            &world.government,
            world.macro_state.unemployment_rate,
            config,
        ),
        central_bank: central_bank_decision(&world.central_bank, &market),
        sources: BTreeMap::new(),
    }
}
