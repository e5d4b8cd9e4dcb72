//! Core utilities: time management

pub mod time;

pub use time::{at_day_boundary, TickClock};
