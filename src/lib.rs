//! Simulation Orchestration Engine
//!
//! Multi-tenant macroeconomic agent-based simulation core: many users
//! bind policy scripts to heterogeneous agents (households, firms,
//! banks, central bank, government) that share one discrete-time world.
//!
//! # Architecture
//!
//! - **core**: tick/day time arithmetic
//! - **rng**: deterministic xorshift64* streams
//! - **config**: recognized configuration keys
//! - **models**: domain types (world, decisions, updates, logs)
//! - **store**: two-tier state store (cache + durable relational)
//! - **registry**: script catalog, bindings, quotas, validation
//! - **sandbox**: subprocess script executor with resource limits
//! - **fallback**: deterministic baseline strategies
//! - **merge**: decision merger (admin > script > baseline)
//! - **logic**: pure market-clearing and evolution modules
//! - **orchestrator**: the control plane and tick loop
//!
//! # Critical Invariants
//!
//! 1. One in-flight tick per simulation (single-writer lock)
//! 2. All randomness flows through seeded purpose streams
//! 3. World state mutates only through `StateUpdateCommand` batches
//!    applied atomically by the store

pub mod config;
pub mod core;
pub mod fallback;
pub mod logic;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod rng;
pub mod sandbox;
pub mod store;

// Re-exports for convenience
pub use crate::core::{at_day_boundary, TickClock};
pub use config::WorldConfig;
pub use models::{
    AgentKind, BalanceSheet, EmploymentStatus, StateUpdateCommand, TickDecisionOverrides,
    TickDecisions, TickLogEntry, UpdateOp, UpdateScope, WorldState,
};
pub use orchestrator::{
    DayResult, Orchestrator, SimStatus, SimulationError, SimulationSummary, TickResult,
};
pub use registry::{RegistryError, ScriptMetadata, ScriptRegistry, ScriptStore};
pub use rng::RngStream;
pub use sandbox::{FailureKind, SandboxExecutor, SandboxFailure, ScriptJob};
pub use store::{
    CacheTier, DurableTier, MemoryCache, SqliteStore, StateStore, StoreError, TickLogQuery,
};
