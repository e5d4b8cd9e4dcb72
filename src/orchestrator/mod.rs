//! Orchestrator: simulation lifecycle and the tick loop

mod context;
mod engine;

pub use context::trim_context;
pub use engine::{
    DayResult, Orchestrator, SimStatus, SimulationError, SimulationSummary, TickResult,
};
