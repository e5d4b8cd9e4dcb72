//! Shock injection
//!
//! Heterogeneous household shocks drawn from truncated normal
//! distributions under the tick's seeded stream. Asset shocks perturb
//! cash positions with zero net sum across the population and a
//! per-household cap; ability shocks scale this tick's labor-matching
//! productivity without touching persisted skill.

use std::collections::BTreeMap;

use crate::config::WorldConfig;
use crate::core::TickClock;
use crate::models::TickLogEntry;
use crate::rng::RngStream;

use super::WorkingState;

/// Apply asset shocks to the working state and return the transient
/// ability multipliers for the labor phase.
pub fn inject_shocks(
    working: &mut WorkingState,
    config: &WorldConfig,
    clock: TickClock,
    seed: u64,
) -> (BTreeMap<String, f64>, TickLogEntry) {
    let mut rng = RngStream::for_purpose(seed, clock.tick_index(), "shock");

    let ability_std = config.features.shock_ability_std.max(0.0);
    let asset_std = config.features.shock_asset_std.max(0.0);
    let max_fraction = config.features.shock_max_fraction.clamp(0.0, 0.9);

    let ids: Vec<String> = working.households.keys().cloned().collect();
    let count = ids.len();
    if count == 0 {
        return (BTreeMap::new(), working.log(clock, "shocks_skipped_empty_world"));
    }

    // ability: multiplier around 1, de-meaned so the population carries
    // no systematic drift, clipped to the configured band
    let mut ability_raw: Vec<f64> = (0..count)
        .map(|_| rng.truncated_normal(0.0, ability_std, -3.0 * ability_std, 3.0 * ability_std))
        .collect();
    de_mean(&mut ability_raw);
    let lower = 1.0 - max_fraction;
    let upper = 1.0 + max_fraction;
    let ability: BTreeMap<String, f64> = ids
        .iter()
        .zip(&ability_raw)
        .map(|(id, raw)| (id.clone(), (1.0 + raw).clamp(lower, upper)))
        .collect();

    // assets: cash-weighted perturbation, de-meaned, clipped per
    // household, residual pushed into the last household so the total is
    // exactly zero
    let cash: Vec<f64> = ids
        .iter()
        .map(|id| working.households[id].balance.cash)
        .collect();
    let mut asset_raw: Vec<f64> = (0..count)
        .map(|_| rng.truncated_normal(0.0, asset_std, -3.0 * asset_std, 3.0 * asset_std))
        .collect();
    de_mean(&mut asset_raw);
    let mut deltas: Vec<f64> = cash.iter().zip(&asset_raw).map(|(c, r)| c * r).collect();
    de_mean(&mut deltas);
    for (delta, c) in deltas.iter_mut().zip(&cash) {
        let bound = c * max_fraction;
        *delta = delta.clamp(-bound, bound);
    }
    if count > 1 {
        let residual: f64 = deltas.iter().sum();
        if residual.abs() > 1e-6 {
            *deltas.last_mut().expect("non-empty") -= residual;
        }
    }

    let mut total_abs = 0.0;
    for (id, delta) in ids.iter().zip(&deltas) {
        let household = working.households.get_mut(id).expect("known id");
        household.balance.cash = (household.balance.cash + delta).max(0.0);
        total_abs += delta.abs();
    }

    let log = working
        .log(clock, "household_shocks_applied")
        .with("households", count as u64)
        .with("total_abs_asset_delta", total_abs);
    (ability, log)
}

fn de_mean(values: &mut [f64]) {
    if values.len() < 2 {
        return;
    }
    let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
    for v in values.iter_mut() {
        *v -= mean;
    }
}
