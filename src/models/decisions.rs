//! Tick decisions and decision overrides
//!
//! A `TickDecisions` record is the fully-resolved input to the market
//! logic: one decision per household plus one per singleton agent. It is
//! produced by the decision merger from up to three sources in strict
//! precedence: admin overrides, script overrides, baseline defaults.
//!
//! Override types mirror the decision types with every field optional and
//! `deny_unknown_fields`: a script returning a key outside the schema has
//! its whole override rejected and the next-priority source wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where a merged decision came from, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Admin,
    Script,
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdDecision {
    /// Labor offered this tick, in [0, 1].
    pub labor_supply: f64,
    /// Cash earmarked for goods purchases.
    pub consumption_budget: f64,
    /// Highest goods price the household will pay.
    pub goods_limit_price: f64,
    /// Share of post-consumption cash moved into deposits, in [0, 1].
    pub savings_rate: f64,
    /// Deposits pulled back into cash before anything else settles.
    pub withdrawal: f64,
    /// Requested loan principal (0 = no request).
    pub loan_request_amount: f64,
    /// Rate the household is willing to pay on the loan.
    pub loan_request_rate: f64,
    /// Face value bid in the bond auction (0 = no bid).
    pub bond_bid: f64,
    /// Tuition paid if enrolling; only honored on the first tick of a day.
    pub education_payment: f64,
    /// Enrollment request; only honored on the first tick of a day.
    pub wants_to_study: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmDecision {
    pub price: f64,
    pub planned_production: f64,
    pub wage_offer: f64,
    /// Additional workers requested this tick.
    pub hiring_demand: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankDecision {
    pub deposit_rate: f64,
    pub loan_rate: f64,
    /// Total principal the bank is willing to extend this tick.
    pub loan_supply: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernmentDecision {
    pub tax_rate: f64,
    pub government_jobs: u64,
    pub transfer_budget: f64,
    /// Face value of bonds auctioned this tick.
    pub bond_issuance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralBankDecision {
    pub policy_rate: f64,
    pub reserve_ratio: f64,
}

/// Fully-resolved decisions for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickDecisions {
    pub households: BTreeMap<String, HouseholdDecision>,
    pub firm: FirmDecision,
    pub bank: BankDecision,
    pub government: GovernmentDecision,
    pub central_bank: CentralBankDecision,
    /// Per-agent provenance (household ids plus the singleton kind names).
    pub sources: BTreeMap<String, DecisionSource>,
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HouseholdDecisionOverride {
    pub labor_supply: Option<f64>,
    pub consumption_budget: Option<f64>,
    pub goods_limit_price: Option<f64>,
    pub savings_rate: Option<f64>,
    pub withdrawal: Option<f64>,
    pub loan_request_amount: Option<f64>,
    pub loan_request_rate: Option<f64>,
    pub bond_bid: Option<f64>,
    pub education_payment: Option<f64>,
    pub wants_to_study: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FirmDecisionOverride {
    pub price: Option<f64>,
    pub planned_production: Option<f64>,
    pub wage_offer: Option<f64>,
    pub hiring_demand: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BankDecisionOverride {
    pub deposit_rate: Option<f64>,
    pub loan_rate: Option<f64>,
    pub loan_supply: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GovernmentDecisionOverride {
    pub tax_rate: Option<f64>,
    pub government_jobs: Option<u64>,
    pub transfer_budget: Option<f64>,
    pub bond_issuance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CentralBankDecisionOverride {
    pub policy_rate: Option<f64>,
    pub reserve_ratio: Option<f64>,
}

/// Partial decisions from one source (a script return value or the
/// admin payload of `run_tick`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TickDecisionOverrides {
    pub households: BTreeMap<String, HouseholdDecisionOverride>,
    pub firm: Option<FirmDecisionOverride>,
    pub bank: Option<BankDecisionOverride>,
    pub government: Option<GovernmentDecisionOverride>,
    pub central_bank: Option<CentralBankDecisionOverride>,
}

impl TickDecisionOverrides {
    pub fn is_empty(&self) -> bool {
        self.households.is_empty()
            && self.firm.is_none()
            && self.bank.is_none()
            && self.government.is_none()
            && self.central_bank.is_none()
    }
}
