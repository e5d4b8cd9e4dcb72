//! Goods market clearing
//!
//! Uniform-price call auction run every tick. Buy orders are sorted by
//! limit price descending (ties broken by the tick's seeded stream, then
//! by ascending id) and filled against firm inventory. The clearing
//! price is the maximum of the firm's posted price and the first
//! unmatched limit price; with every order filled it is the posted
//! price. Orders limited below the posted price never trade.

use crate::core::TickClock;
use crate::models::{TickDecisions, TickLogEntry};
use crate::rng::RngStream;

use super::{TickMetrics, WorkingState};

struct BuyOrder {
    household_id: String,
    quantity: f64,
    limit: f64,
    tie_break: u64,
}

pub fn clear_goods_market(
    working: &mut WorkingState,
    decisions: &TickDecisions,
    clock: TickClock,
    seed: u64,
    metrics: &mut TickMetrics,
) -> TickLogEntry {
    let posted = working.firm.price.max(0.1);

    let mut orders: Vec<BuyOrder> = Vec::new();
    for (id, decision) in &decisions.households {
        let household = match working.households.get(id) {
            Some(h) => h,
            None => continue,
        };
        let budget = decision.consumption_budget.min(household.balance.cash);
        let quantity = (budget / posted).clamp(0.0, 200.0);
        if quantity <= 0.0 {
            continue;
        }
        let tie_break = RngStream::for_agent(seed, clock.tick_index(), "goods", id).next_u64();
        orders.push(BuyOrder {
            household_id: id.clone(),
            quantity,
            limit: decision.goods_limit_price.max(0.0),
            tie_break,
        });
    }

    orders.sort_by(|a, b| {
        b.limit
            .partial_cmp(&a.limit)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tie_break.cmp(&b.tie_break))
            .then_with(|| a.household_id.cmp(&b.household_id))
    });

    // greedy fill; the first order that cannot fully fill (or prices
    // itself out) sets the unmatched limit
    let mut remaining = working.firm.inventory;
    let mut fills: Vec<(String, f64)> = Vec::new();
    let mut first_unmatched_limit: Option<f64> = None;
    for order in &orders {
        if order.limit < posted {
            first_unmatched_limit.get_or_insert(order.limit);
            continue;
        }
        let fill = order.quantity.min(remaining);
        if fill < order.quantity && first_unmatched_limit.is_none() {
            first_unmatched_limit = Some(order.limit);
        }
        if fill > 0.0 {
            fills.push((order.household_id.clone(), fill));
            remaining -= fill;
        }
    }

    let clearing_price = match first_unmatched_limit {
        Some(limit) => posted.max(limit),
        None => posted,
    };

    let mut goods_sold = 0.0;
    let mut consumption_value = 0.0;
    for (id, fill) in fills {
        let household = working.households.get_mut(&id).expect("order came from map");
        // cash was checked at posted price; re-cap at the clearing price
        let affordable = household.balance.cash / clearing_price;
        let take = fill.min(affordable);
        if take <= 0.0 {
            continue;
        }
        let payment = take * clearing_price;
        household.balance.cash = (household.balance.cash - payment).max(0.0);
        household.last_consumption = take;
        goods_sold += take;
        consumption_value += payment;
    }

    working.firm.inventory = (working.firm.inventory - goods_sold).max(0.0);
    working.firm.balance.cash += consumption_value;
    working.firm.last_sales = goods_sold;
    metrics.goods_sold = goods_sold;
    metrics.consumption_value = consumption_value;

    working
        .log(clock, "goods_market_cleared")
        .with("goods_sold", goods_sold)
        .with("consumption_value", consumption_value)
        .with("clearing_price", clearing_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::fallback::baseline_tick_decisions;
    use crate::models::WorldState;

    fn setup() -> (WorkingState, TickDecisions) {
        let config = WorldConfig::default();
        let world = WorldState::initial("sim-1", &config);
        let decisions = baseline_tick_decisions(&world, &config);
        (WorkingState::from_world(&world), decisions)
    }

    #[test]
    fn test_inventory_never_oversold() {
        let (mut working, decisions) = setup();
        working.firm.inventory = 5.0;
        let clock = TickClock::for_next_tick(0, 3);
        let mut metrics = TickMetrics::default();
        clear_goods_market(&mut working, &decisions, clock, 42, &mut metrics);
        assert!(working.firm.inventory >= 0.0);
        assert!(metrics.goods_sold <= 5.0 + 1e-9);
    }

    #[test]
    fn test_clearing_price_rises_with_unmatched_demand() {
        let (mut working, mut decisions) = setup();
        working.firm.inventory = 1.0;
        // one household bids far above the posted price for everything
        for (id, d) in decisions.households.iter_mut() {
            if id == "000" {
                d.goods_limit_price = 50.0;
                d.consumption_budget = 100.0;
            } else {
                d.goods_limit_price = 15.0;
                d.consumption_budget = 50.0;
            }
        }
        let clock = TickClock::for_next_tick(0, 3);
        let mut metrics = TickMetrics::default();
        let log = clear_goods_market(&mut working, &decisions, clock, 42, &mut metrics);
        let clearing = log.context["clearing_price"].as_f64().unwrap();
        assert!(clearing > working.firm.price);
    }

    #[test]
    fn test_below_posted_limit_never_trades() {
        let (mut working, mut decisions) = setup();
        for d in decisions.households.values_mut() {
            d.goods_limit_price = working.firm.price * 0.5;
        }
        let clock = TickClock::for_next_tick(0, 3);
        let mut metrics = TickMetrics::default();
        clear_goods_market(&mut working, &decisions, clock, 42, &mut metrics);
        assert_eq!(metrics.goods_sold, 0.0);
    }

    #[test]
    fn test_tie_breaking_is_stable() {
        let (working, decisions) = setup();
        let clock = TickClock::for_next_tick(0, 3);

        let mut a = working.clone();
        let mut b = working.clone();
        let mut ma = TickMetrics::default();
        let mut mb = TickMetrics::default();
        clear_goods_market(&mut a, &decisions, clock, 42, &mut ma);
        clear_goods_market(&mut b, &decisions, clock, 42, &mut mb);
        for (id, ha) in &a.households {
            assert_eq!(ha.last_consumption, b.households[id].last_consumption);
        }
    }
}
