//! Domain types: world state, decisions, update commands, tick logs

pub mod decisions;
pub mod log;
pub mod update;
pub mod world;

pub use decisions::{
    BankDecision, BankDecisionOverride, CentralBankDecision, CentralBankDecisionOverride,
    DecisionSource, FirmDecision, FirmDecisionOverride, GovernmentDecision,
    GovernmentDecisionOverride, HouseholdDecision, HouseholdDecisionOverride, TickDecisionOverrides,
    TickDecisions,
};
pub use log::TickLogEntry;
pub use update::{apply_command, StateUpdateCommand, UpdateError, UpdateOp, UpdateScope};
pub use world::{
    AgentKind, BalanceSheet, BankState, CentralBankState, EmploymentStatus, FirmState,
    GovernmentState, HouseholdState, MacroState, PublicMarketData, WorldState,
};
