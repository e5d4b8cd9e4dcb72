//! World state
//!
//! The per-simulation aggregate: every agent's record plus the macro
//! statistics. All maps are `BTreeMap` so iteration order (and therefore
//! serialization, clearing order and log order) is deterministic.
//!
//! # Critical Invariants
//!
//! 1. A world exists iff its simulation exists; every persisted update is
//!    the result of a completed tick or a reset.
//! 2. `employment_status == Unemployed` ⇔ `employer_id == None`.
//! 3. `is_studying` implies unemployed.
//! 4. `firm.employees` equals the set of households whose `employer_id`
//!    is the firm's id (the household side is the source of truth).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::WorldConfig;
use crate::rng::RngStream;

/// The five scriptable agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Household,
    Firm,
    Bank,
    CentralBank,
    Government,
}

impl AgentKind {
    /// Stable wire name, matching the script context contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Household => "household",
            AgentKind::Firm => "firm",
            AgentKind::Bank => "bank",
            AgentKind::CentralBank => "central_bank",
            AgentKind::Government => "government",
        }
    }

    /// The singleton kinds (everything except households).
    pub fn singletons() -> [AgentKind; 4] {
        [
            AgentKind::Firm,
            AgentKind::Bank,
            AgentKind::CentralBank,
            AgentKind::Government,
        ]
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Employment status for household agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Unemployed,
    EmployedFirm,
    EmployedGovernment,
}

/// Agent balance sheet. All stocks are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSheet {
    pub cash: f64,
    pub deposits: f64,
    pub loans: f64,
    pub bond_holdings: f64,
}

impl Default for BalanceSheet {
    fn default() -> Self {
        Self {
            cash: 0.0,
            deposits: 0.0,
            loans: 0.0,
            bond_holdings: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdState {
    pub id: String,
    pub balance: BalanceSheet,
    pub skill: f64,
    /// Accumulated education, capped at 1.5.
    pub education_level: f64,
    pub employment_status: EmploymentStatus,
    pub employer_id: Option<String>,
    /// Mutable only at the first tick of a day.
    pub is_studying: bool,
    pub wage_income: f64,
    pub last_consumption: f64,
    pub reservation_wage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmState {
    pub id: String,
    pub balance: BalanceSheet,
    /// Posted goods price, never below 0.1.
    pub price: f64,
    pub wage_offer: f64,
    pub planned_production: f64,
    pub inventory: f64,
    pub capital_stock: f64,
    pub productivity: f64,
    /// Derived view of the employment relation; co-updated with the
    /// households' `employer_id` inside the same update batch.
    pub employees: Vec<String>,
    pub last_sales: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankState {
    pub id: String,
    pub reserves: f64,
    pub deposits: f64,
    /// Outstanding loan principal per household.
    pub loans: BTreeMap<String, f64>,
    pub bond_holdings: f64,
    pub deposit_rate: f64,
    pub loan_rate: f64,
}

impl BankState {
    /// Whether the reserve requirement currently holds. While violated,
    /// no new loans may be approved this tick.
    pub fn meets_reserve_requirement(&self, reserve_ratio: f64) -> bool {
        self.reserves >= reserve_ratio * self.deposits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralBankState {
    pub id: String,
    /// Policy rate, held in [0, 0.4].
    pub policy_rate: f64,
    /// Reserve ratio, held in [0.05, 0.2].
    pub reserve_ratio: f64,
    pub inflation_target: f64,
    pub unemployment_target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernmentState {
    pub id: String,
    pub balance: BalanceSheet,
    pub tax_rate: f64,
    pub spending: f64,
    pub unemployment_benefit: f64,
    pub employees: Vec<String>,
    pub outstanding_debt: f64,
    /// Face value of bonds to auction next tick.
    pub bond_issuance_plan: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroState {
    pub gdp: f64,
    pub inflation: f64,
    pub unemployment_rate: f64,
    pub price_index: f64,
    pub wage_index: f64,
}

/// The market fields every script is allowed to observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMarketData {
    pub goods_price: f64,
    pub wage_offer: f64,
    pub deposit_rate: f64,
    pub loan_rate: f64,
    pub tax_rate: f64,
    pub unemployment_rate: f64,
    pub inflation: f64,
}

/// Top-level world state snapshot for a simulation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub simulation_id: String,
    pub tick: u64,
    pub day: u64,
    pub households: BTreeMap<String, HouseholdState>,
    pub firm: FirmState,
    pub bank: BankState,
    pub central_bank: CentralBankState,
    pub government: GovernmentState,
    pub macro_state: MacroState,
}

impl WorldState {
    /// Synthesize the initial world for a fresh simulation.
    ///
    /// All draws come from a purpose stream over the global seed, so
    /// `ensure_simulation` is reproducible: the same `(id, config)` pair
    /// always yields the same world.
    pub fn initial(simulation_id: &str, config: &WorldConfig) -> Self {
        let mut rng = RngStream::for_purpose(config.simulation.global_rng_seed, 0, "world_init");

        let mut households = BTreeMap::new();
        for idx in 0..config.simulation.num_households {
            let id = format!("{idx:03}");
            let skill = rng.normal(1.0, 0.15).max(0.4);
            let cash = rng.range_f64(200.0, 400.0);
            let deposits = rng.range_f64(100.0, 200.0);
            let reservation_wage =
                (config.markets.labor.base_wage * skill * 0.8).clamp(40.0, 120.0);
            households.insert(
                id.clone(),
                HouseholdState {
                    id,
                    balance: BalanceSheet {
                        cash,
                        deposits,
                        loans: 0.0,
                        bond_holdings: 0.0,
                    },
                    skill,
                    education_level: 0.0,
                    employment_status: EmploymentStatus::Unemployed,
                    employer_id: None,
                    is_studying: false,
                    wage_income: 0.0,
                    last_consumption: 0.0,
                    reservation_wage,
                },
            );
        }

        let total_deposits: f64 = households.values().map(|h| h.balance.deposits).sum();

        let firm = FirmState {
            id: "firm_1".to_string(),
            balance: BalanceSheet {
                cash: 50_000.0,
                deposits: 10_000.0,
                ..BalanceSheet::default()
            },
            price: config.markets.goods.base_price.max(0.1),
            wage_offer: config.markets.labor.base_wage,
            planned_production: 0.0,
            inventory: config.simulation.num_households as f64
                * config.markets.goods.subsistence_consumption
                * 2.0,
            capital_stock: 10_000.0,
            productivity: rng.normal(1.0, 0.1).clamp(0.6, 1.4),
            employees: Vec::new(),
            last_sales: 0.0,
        };

        let bank = BankState {
            id: "bank".to_string(),
            reserves: 200_000.0,
            deposits: total_deposits,
            loans: BTreeMap::new(),
            bond_holdings: 0.0,
            deposit_rate: config.markets.finance.deposit_rate,
            loan_rate: config.markets.finance.loan_rate,
        };

        let central_bank = CentralBankState {
            id: "central_bank".to_string(),
            policy_rate: config.policies.central_bank.base_rate.clamp(0.0, 0.4),
            reserve_ratio: config.policies.central_bank.reserve_ratio.clamp(0.05, 0.2),
            inflation_target: config.policies.central_bank.inflation_target,
            unemployment_target: config.policies.central_bank.unemployment_target,
        };

        let government = GovernmentState {
            id: "government".to_string(),
            balance: BalanceSheet {
                cash: 100_000.0,
                ..BalanceSheet::default()
            },
            tax_rate: config.policies.tax_rate,
            spending: config.policies.government_spending,
            unemployment_benefit: config.policies.unemployment_benefit,
            employees: Vec::new(),
            outstanding_debt: 0.0,
            bond_issuance_plan: 0.0,
        };

        let macro_state = MacroState {
            gdp: 0.0,
            inflation: 0.0,
            unemployment_rate: 1.0,
            price_index: 100.0,
            wage_index: 100.0,
        };

        Self {
            simulation_id: simulation_id.to_string(),
            tick: 0,
            day: 0,
            households,
            firm,
            bank,
            central_bank,
            government,
            macro_state,
        }
    }

    /// The visible market slice shared with every script.
    pub fn public_market_data(&self) -> PublicMarketData {
        PublicMarketData {
            goods_price: self.firm.price,
            wage_offer: self.firm.wage_offer,
            deposit_rate: self.bank.deposit_rate,
            loan_rate: self.bank.loan_rate,
            tax_rate: self.government.tax_rate,
            unemployment_rate: self.macro_state.unemployment_rate,
            inflation: self.macro_state.inflation,
        }
    }

    /// Check the structural invariants the engine must never persist a
    /// violation of. Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (id, h) in &self.households {
            if h.id != *id {
                return Err(format!("household key {id} does not match record id {}", h.id));
            }
            let unemployed = h.employment_status == EmploymentStatus::Unemployed;
            if unemployed != h.employer_id.is_none() {
                return Err(format!(
                    "household {id}: employment_status and employer_id disagree"
                ));
            }
            if let Some(employer) = &h.employer_id {
                if employer != &self.firm.id && employer != &self.government.id {
                    return Err(format!("household {id}: unknown employer {employer}"));
                }
            }
            if h.is_studying && !unemployed {
                return Err(format!("household {id}: studying while employed"));
            }
            if h.balance.bond_holdings < -1e-6 {
                return Err(format!("household {id}: negative bond holdings"));
            }
            if h.balance.cash < -1e-6 || h.balance.deposits < -1e-6 {
                return Err(format!("household {id}: negative balance"));
            }
            if !(0.0..=1.5).contains(&h.education_level) {
                return Err(format!("household {id}: education_level out of range"));
            }
        }

        let firm_side: Vec<&String> = self.firm.employees.iter().collect();
        for id in &firm_side {
            match self.households.get(*id) {
                Some(h) if h.employer_id.as_deref() == Some(self.firm.id.as_str()) => {}
                _ => return Err(format!("firm employee {id} has no matching household record")),
            }
        }
        let household_side = self
            .households
            .values()
            .filter(|h| h.employer_id.as_deref() == Some(self.firm.id.as_str()))
            .count();
        if household_side != self.firm.employees.len() {
            return Err("firm.employees diverges from household employer_id".to_string());
        }

        if self.firm.price < 0.1 {
            return Err("firm price below floor".to_string());
        }
        if !(0.0..=0.4).contains(&self.central_bank.policy_rate) {
            return Err("policy_rate out of range".to_string());
        }
        if !(0.05..=0.2).contains(&self.central_bank.reserve_ratio) {
            return Err("reserve_ratio out of range".to_string());
        }
        // The tick/day relation needs ticks_per_day and is checked by the
        // orchestrator after every apply.
        Ok(())
    }
}
