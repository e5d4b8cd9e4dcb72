//! Time management for the simulation
//!
//! The simulation operates in discrete ticks. Multiple ticks form a day.
//! This module provides deterministic time arithmetic for the tick being
//! executed: a `TickClock` describes tick `t + 1` while the persisted
//! world is still at tick `t`.

use serde::{Deserialize, Serialize};

/// Clock for a single tick execution.
///
/// A simulation whose world state records tick `t` executes tick `t + 1`
/// next. The clock answers the calendar questions the market logic needs:
/// which day the tick belongs to, whether it is the first tick of a day
/// (wages, labor matching, education) and what `(tick, day)` the world
/// should record once the tick completes.
///
/// # Example
/// ```
/// use econ_sim_core_rs::TickClock;
///
/// // World at tick 0, 3 ticks per day: about to execute tick 1.
/// let clock = TickClock::for_next_tick(0, 3);
/// assert_eq!(clock.tick_index(), 1);
/// assert!(clock.is_first_tick_of_day());
/// assert_eq!(clock.completed_day(), 0);
///
/// // World at tick 2: executing tick 3 closes day 0.
/// let clock = TickClock::for_next_tick(2, 3);
/// assert_eq!(clock.day(), 0);
/// assert_eq!(clock.completed_day(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickClock {
    /// The tick being executed (1-based: the first `run_tick` executes tick 1)
    tick_index: u64,
    /// Number of ticks in one day
    ticks_per_day: u64,
}

impl TickClock {
    /// Build the clock for the tick following `current_tick`.
    pub fn for_next_tick(current_tick: u64, ticks_per_day: u64) -> Self {
        assert!(ticks_per_day > 0, "ticks_per_day must be positive");
        Self {
            tick_index: current_tick + 1,
            ticks_per_day,
        }
    }

    /// The tick being executed.
    pub fn tick_index(&self) -> u64 {
        self.tick_index
    }

    /// The day this tick belongs to (0-indexed).
    ///
    /// With 3 ticks per day, ticks 1..=3 belong to day 0 and tick 4 opens
    /// day 1.
    pub fn day(&self) -> u64 {
        (self.tick_index - 1) / self.ticks_per_day
    }

    /// Position of this tick within its day (1-based).
    pub fn tick_in_day(&self) -> u64 {
        (self.tick_index - 1) % self.ticks_per_day + 1
    }

    /// Whether this tick opens a new day.
    ///
    /// Day-scoped operations (labor matching, wage payment, education
    /// enrollment, bond coupons) run only when this is true.
    pub fn is_first_tick_of_day(&self) -> bool {
        self.tick_in_day() == 1
    }

    /// Whether completing this tick closes the current day.
    pub fn completes_day(&self) -> bool {
        self.tick_index % self.ticks_per_day == 0
    }

    /// Tick counter the world records once this tick completes.
    pub fn completed_tick(&self) -> u64 {
        self.tick_index
    }

    /// Day counter the world records once this tick completes
    /// (`floor(tick / ticks_per_day)`).
    pub fn completed_day(&self) -> u64 {
        self.tick_index / self.ticks_per_day
    }

    /// Ticks per day this clock was built with.
    pub fn ticks_per_day(&self) -> u64 {
        self.ticks_per_day
    }
}

/// Whether a world currently at `tick` sits on a day boundary.
///
/// Script code rotation is only permitted at day boundaries: before any
/// tick has run, or immediately after a day's last tick completed.
pub fn at_day_boundary(tick: u64, ticks_per_day: u64) -> bool {
    ticks_per_day > 0 && tick % ticks_per_day == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "ticks_per_day must be positive")]
    fn test_zero_ticks_per_day_panics() {
        TickClock::for_next_tick(0, 0);
    }

    #[test]
    fn test_day_rollover() {
        // tpd = 3: ticks 1,2,3 belong to day 0; completing tick 3 records day 1
        for t in 0..3u64 {
            let clock = TickClock::for_next_tick(t, 3);
            assert_eq!(clock.day(), 0);
        }
        let clock = TickClock::for_next_tick(2, 3);
        assert!(clock.completes_day());
        assert_eq!(clock.completed_tick(), 3);
        assert_eq!(clock.completed_day(), 1);

        let clock = TickClock::for_next_tick(3, 3);
        assert_eq!(clock.day(), 1);
        assert!(clock.is_first_tick_of_day());
    }

    #[test]
    fn test_tick_in_day_is_one_based() {
        assert_eq!(TickClock::for_next_tick(0, 3).tick_in_day(), 1);
        assert_eq!(TickClock::for_next_tick(1, 3).tick_in_day(), 2);
        assert_eq!(TickClock::for_next_tick(2, 3).tick_in_day(), 3);
        assert_eq!(TickClock::for_next_tick(3, 3).tick_in_day(), 1);
    }

    #[test]
    fn test_day_boundary() {
        assert!(at_day_boundary(0, 3));
        assert!(!at_day_boundary(2, 3));
        assert!(at_day_boundary(3, 3));
        assert!(at_day_boundary(6, 3));
    }
}
