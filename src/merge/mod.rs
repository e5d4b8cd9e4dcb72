//! Decision merger
//!
//! Deep-merges three decision sources into one `TickDecisions` record
//! with strict per-field precedence (highest wins):
//!
//! 1. admin overrides passed to `run_tick`,
//! 2. script-produced overrides,
//! 3. baseline fallback defaults.
//!
//! Unknown fields have already rejected a script override upstream (the
//! override types are `deny_unknown_fields`); this module additionally
//! strips fields a binding is not allowed to touch (a household script
//! only affects its own household) and clamps numeric fields to their
//! declared ranges, logging a warning per clamp.

use std::collections::BTreeMap;

use crate::core::TickClock;
use crate::models::{
    AgentKind, DecisionSource, TickDecisionOverrides, TickDecisions, TickLogEntry,
};

/// Merge result plus the warning log entries produced along the way.
pub struct MergeOutcome {
    pub decisions: TickDecisions,
    pub warnings: Vec<TickLogEntry>,
}

/// Restrict a script override to the slice its binding owns.
///
/// Household bindings keep only their own household entry; singleton
/// bindings keep only their own section. Everything else is dropped and
/// reported, satisfying script isolation: a script cannot produce an
/// effect on another agent's decisions.
pub fn scope_script_override(
    kind: AgentKind,
    entity_id: &str,
    mut raw: TickDecisionOverrides,
) -> (TickDecisionOverrides, Vec<String>) {
    let mut dropped = Vec::new();
    let mut scoped = TickDecisionOverrides::default();

    match kind {
        AgentKind::Household => {
            for (id, entry) in std::mem::take(&mut raw.households) {
                if id == entity_id {
                    scoped.households.insert(id, entry);
                } else {
                    dropped.push(format!("households.{id}"));
                }
            }
        }
        AgentKind::Firm => scoped.firm = raw.firm.take(),
        AgentKind::Bank => scoped.bank = raw.bank.take(),
        AgentKind::Government => scoped.government = raw.government.take(),
        AgentKind::CentralBank => scoped.central_bank = raw.central_bank.take(),
    }

    if kind != AgentKind::Household && !raw.households.is_empty() {
        for id in raw.households.keys() {
            dropped.push(format!("households.{id}"));
        }
    }
    if raw.firm.is_some() && kind != AgentKind::Firm {
        dropped.push("firm".to_string());
    }
    if raw.bank.is_some() && kind != AgentKind::Bank {
        dropped.push("bank".to_string());
    }
    if raw.government.is_some() && kind != AgentKind::Government {
        dropped.push("government".to_string());
    }
    if raw.central_bank.is_some() && kind != AgentKind::CentralBank {
        dropped.push("central_bank".to_string());
    }

    (scoped, dropped)
}

/// Merge overrides onto the baseline with precedence and clamping.
pub fn merge_tick_decisions(
    simulation_id: &str,
    clock: TickClock,
    mut baseline: TickDecisions,
    script_overrides: &[TickDecisionOverrides],
    admin_overrides: Option<&TickDecisionOverrides>,
) -> MergeOutcome {
    // every agent starts with baseline provenance; override application
    // upgrades the tag
    baseline.sources = baseline
        .households
        .keys()
        .cloned()
        .chain(AgentKind::singletons().iter().map(|k| k.as_str().to_string()))
        .map(|agent| (agent, DecisionSource::Baseline))
        .collect();

    let mut merger = Merger {
        simulation_id: simulation_id.to_string(),
        clock,
        decisions: baseline,
        warnings: Vec::new(),
    };

    for overrides in script_overrides {
        merger.apply(overrides, DecisionSource::Script);
    }
    if let Some(overrides) = admin_overrides {
        merger.apply(overrides, DecisionSource::Admin);
    }

    MergeOutcome {
        decisions: merger.decisions,
        warnings: merger.warnings,
    }
}

struct Merger {
    simulation_id: String,
    clock: TickClock,
    decisions: TickDecisions,
    warnings: Vec<TickLogEntry>,
}

impl Merger {
    fn apply(&mut self, overrides: &TickDecisionOverrides, source: DecisionSource) {
        for (id, entry) in &overrides.households {
            // an override for a household that does not exist in the
            // baseline refers to an unknown agent; drop it
            if !self.decisions.households.contains_key(id) {
                self.warn("override_unknown_household", &format!("households.{id}"));
                continue;
            }
            let mut warnings = Vec::new();
            {
                let decision = self.decisions.households.get_mut(id).expect("checked");
                if let Some(v) = entry.labor_supply {
                    decision.labor_supply = clamp(v, 0.0, 1.0, "labor_supply", &mut warnings);
                }
                if let Some(v) = entry.consumption_budget {
                    decision.consumption_budget =
                        clamp_min(v, 0.0, "consumption_budget", &mut warnings);
                }
                if let Some(v) = entry.goods_limit_price {
                    decision.goods_limit_price =
                        clamp_min(v, 0.0, "goods_limit_price", &mut warnings);
                }
                if let Some(v) = entry.savings_rate {
                    decision.savings_rate = clamp(v, 0.0, 1.0, "savings_rate", &mut warnings);
                }
                if let Some(v) = entry.withdrawal {
                    decision.withdrawal = clamp_min(v, 0.0, "withdrawal", &mut warnings);
                }
                if let Some(v) = entry.loan_request_amount {
                    decision.loan_request_amount =
                        clamp_min(v, 0.0, "loan_request_amount", &mut warnings);
                }
                if let Some(v) = entry.loan_request_rate {
                    decision.loan_request_rate =
                        clamp(v, 0.0, 1.0, "loan_request_rate", &mut warnings);
                }
                if let Some(v) = entry.bond_bid {
                    decision.bond_bid = clamp_min(v, 0.0, "bond_bid", &mut warnings);
                }
                if let Some(v) = entry.education_payment {
                    decision.education_payment =
                        clamp_min(v, 0.0, "education_payment", &mut warnings);
                }
                if let Some(v) = entry.wants_to_study {
                    decision.wants_to_study = v;
                }
            }
            self.flush_clamp_warnings(&format!("households.{id}"), warnings);
            self.decisions.sources.insert(id.clone(), source);
        }

        if let Some(entry) = &overrides.firm {
            let mut warnings = Vec::new();
            if let Some(v) = entry.price {
                self.decisions.firm.price = clamp_min(v, 0.1, "price", &mut warnings);
            }
            if let Some(v) = entry.planned_production {
                self.decisions.firm.planned_production =
                    clamp_min(v, 0.0, "planned_production", &mut warnings);
            }
            if let Some(v) = entry.wage_offer {
                self.decisions.firm.wage_offer = clamp_min(v, 0.0, "wage_offer", &mut warnings);
            }
            if let Some(v) = entry.hiring_demand {
                self.decisions.firm.hiring_demand = v;
            }
            self.flush_clamp_warnings("firm", warnings);
            self.decisions
                .sources
                .insert(AgentKind::Firm.as_str().to_string(), source);
        }

        if let Some(entry) = &overrides.bank {
            let mut warnings = Vec::new();
            if let Some(v) = entry.deposit_rate {
                self.decisions.bank.deposit_rate =
                    clamp(v, 0.0, 1.0, "deposit_rate", &mut warnings);
            }
            if let Some(v) = entry.loan_rate {
                self.decisions.bank.loan_rate = clamp(v, 0.0, 1.0, "loan_rate", &mut warnings);
            }
            if let Some(v) = entry.loan_supply {
                self.decisions.bank.loan_supply = clamp_min(v, 0.0, "loan_supply", &mut warnings);
            }
            self.flush_clamp_warnings("bank", warnings);
            self.decisions
                .sources
                .insert(AgentKind::Bank.as_str().to_string(), source);
        }

        if let Some(entry) = &overrides.government {
            let mut warnings = Vec::new();
            if let Some(v) = entry.tax_rate {
                self.decisions.government.tax_rate =
                    clamp(v, 0.0, 0.6, "tax_rate", &mut warnings);
            }
            if let Some(v) = entry.government_jobs {
                self.decisions.government.government_jobs = v;
            }
            if let Some(v) = entry.transfer_budget {
                self.decisions.government.transfer_budget =
                    clamp_min(v, 0.0, "transfer_budget", &mut warnings);
            }
            if let Some(v) = entry.bond_issuance {
                self.decisions.government.bond_issuance =
                    clamp_min(v, 0.0, "bond_issuance", &mut warnings);
            }
            self.flush_clamp_warnings("government", warnings);
            self.decisions
                .sources
                .insert(AgentKind::Government.as_str().to_string(), source);
        }

        if let Some(entry) = &overrides.central_bank {
            let mut warnings = Vec::new();
            if let Some(v) = entry.policy_rate {
                self.decisions.central_bank.policy_rate =
                    clamp(v, 0.0, 0.4, "policy_rate", &mut warnings);
            }
            if let Some(v) = entry.reserve_ratio {
                self.decisions.central_bank.reserve_ratio =
                    clamp(v, 0.05, 0.2, "reserve_ratio", &mut warnings);
            }
            self.flush_clamp_warnings("central_bank", warnings);
            self.decisions
                .sources
                .insert(AgentKind::CentralBank.as_str().to_string(), source);
        }
    }

    fn warn(&mut self, message: &str, field: &str) {
        self.warnings.push(
            TickLogEntry::new(
                &self.simulation_id,
                self.clock.tick_index(),
                self.clock.day(),
                message,
            )
            .with("field", field),
        );
    }

    fn flush_clamp_warnings(&mut self, scope: &str, fields: Vec<String>) {
        for field in fields {
            self.warn("override_clamped", &format!("{scope}.{field}"));
        }
    }
}

fn clamp(value: f64, lo: f64, hi: f64, field: &str, warnings: &mut Vec<String>) -> f64 {
    if value < lo || value > hi {
        warnings.push(field.to_string());
    }
    value.clamp(lo, hi)
}

fn clamp_min(value: f64, lo: f64, field: &str, warnings: &mut Vec<String>) -> f64 {
    if value < lo {
        warnings.push(field.to_string());
    }
    value.max(lo)
}
