//! Macro statistics
//!
//! Final phase: exponential-moving-average price and wage indexes,
//! inflation from the price-index delta, GDP as the sum of the tick's
//! consumption, payrolls and transfers, and the unemployment rate read
//! off the post-clearing household states.

use crate::core::TickClock;
use crate::models::{EmploymentStatus, TickLogEntry};

use super::{TickMetrics, WorkingState};

pub fn update_macro_statistics(
    working: &mut WorkingState,
    clock: TickClock,
    metrics: &TickMetrics,
) -> TickLogEntry {
    let previous_price = non_zero(working.macro_state.price_index, 100.0);
    let price_index = 0.9 * previous_price + 0.1 * working.firm.price;

    let previous_wage = non_zero(working.macro_state.wage_index, 100.0);
    let wage_index = 0.9 * previous_wage + 0.1 * working.firm.wage_offer;

    let inflation = (price_index - previous_price) / previous_price;

    let total = working.households.len().max(1) as f64;
    let employed = working
        .households
        .values()
        .filter(|h| h.employment_status != EmploymentStatus::Unemployed)
        .count() as f64;
    let unemployment_rate = (1.0 - employed / total).clamp(0.0, 1.0);

    let gdp = metrics.consumption_value
        + metrics.wage_payments_firm
        + metrics.wage_payments_government
        + metrics.transfers;

    working.macro_state.gdp = gdp;
    working.macro_state.inflation = inflation;
    working.macro_state.unemployment_rate = unemployment_rate;
    working.macro_state.price_index = price_index;
    working.macro_state.wage_index = wage_index;

    working
        .log(clock, "macro_statistics_updated")
        .with("gdp", gdp)
        .with("inflation", inflation)
        .with("unemployment_rate", unemployment_rate)
        .with("price_index", price_index)
}

fn non_zero(value: f64, fallback: f64) -> f64 {
    if value.abs() < f64::EPSILON {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::models::WorldState;

    #[test]
    fn test_price_index_is_smoothed() {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let mut working = WorkingState::from_world(&world);
        working.firm.price = 20.0;
        let clock = TickClock::for_next_tick(0, 3);
        update_macro_statistics(&mut working, clock, &TickMetrics::default());
        // EMA: 0.9 * 100 + 0.1 * 20 = 92
        assert!((working.macro_state.price_index - 92.0).abs() < 1e-9);
        assert!(working.macro_state.inflation < 0.0);
    }

    #[test]
    fn test_unemployment_rate_counts_statuses() {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let mut working = WorkingState::from_world(&world);
        let clock = TickClock::for_next_tick(0, 3);
        update_macro_statistics(&mut working, clock, &TickMetrics::default());
        assert_eq!(working.macro_state.unemployment_rate, 1.0);

        for id in ["000", "001"] {
            let h = working.households.get_mut(id).unwrap();
            h.employment_status = EmploymentStatus::EmployedFirm;
            h.employer_id = Some("firm_1".to_string());
        }
        update_macro_statistics(&mut working, clock, &TickMetrics::default());
        assert!((working.macro_state.unemployment_rate - 0.98).abs() < 1e-9);
    }
}
