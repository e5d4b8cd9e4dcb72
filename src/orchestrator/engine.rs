//! Orchestrator engine
//!
//! The control plane. Owns the per-simulation state machine
//! `{Uninitialized, Ready, Advancing, Locked, Failed}` and the only code
//! path allowed to mutate world state. One tick:
//!
//! 1. acquire the simulation's single-writer lock (state → Advancing)
//! 2. read the world through the state store
//! 3. coverage guard: every required agent has a script or an
//!    authorized fallback, else `MissingAgentScripts` (state → Ready,
//!    no tick consumed)
//! 4. resolve bindings, trim per-binding contexts
//! 5. dispatch every binding to the sandbox concurrently
//! 6. absorb script failures into fallback, log `script_failure` events
//! 7. merge admin overrides > script overrides > baseline
//! 8. run the logic modules in fixed order
//! 9. apply commands atomically, append tick logs
//! 10. bump tick/day, state → Ready
//!
//! Store or invariant failures freeze the simulation (state → Failed)
//! until reset; coverage and script failures never do.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorldConfig;
use crate::core::{at_day_boundary, TickClock};
use crate::fallback::baseline_tick_decisions;
use crate::logic;
use crate::merge::{merge_tick_decisions, scope_script_override};
use crate::models::{
    AgentKind, MacroState, StateUpdateCommand, TickDecisionOverrides, TickLogEntry, UpdateScope,
    WorldState,
};
use crate::registry::{
    RegistryError, ResolvedBinding, ScriptFailureEvent, ScriptMetadata, ScriptRegistry,
};
use crate::sandbox::{FailureKind, SandboxExecutor, ScriptJob};
use crate::store::{StateStore, StoreError, TickLogQuery};

use super::context::trim_context;

/// Lifecycle state of one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    Uninitialized,
    Ready,
    Advancing,
    /// Frozen by an operator; ticks are refused until unlocked.
    Locked,
    /// Frozen by a persistence or invariant failure; reset to recover.
    Failed,
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid script: {0}")]
    InvalidScript(String),

    #[error("invalid override: {0}")]
    InvalidOverride(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting binding: {0}")]
    ConflictingBinding(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("simulation {simulation_id} is not at a day boundary (tick {tick})")]
    NotAtDayBoundary { simulation_id: String, tick: u64 },

    #[error("simulation {0} is locked")]
    SimulationLocked(String),

    #[error("missing agent scripts for simulation {simulation_id}: {missing:?}")]
    MissingAgentScripts {
        simulation_id: String,
        missing: Vec<String>,
    },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("durable store error: {0}")]
    DurableStore(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SimulationError {
    /// Stable numeric code for the transport layer.
    pub fn code(&self) -> u16 {
        match self {
            SimulationError::InvalidScript(_) => 1001,
            SimulationError::InvalidOverride(_) => 1002,
            SimulationError::InvalidConfig(_) => 1003,
            SimulationError::NotFound(_) => 1101,
            SimulationError::ConflictingBinding(_) => 1102,
            SimulationError::QuotaExceeded(_) => 1103,
            SimulationError::NotAtDayBoundary { .. } => 1104,
            SimulationError::SimulationLocked(_) => 1105,
            SimulationError::MissingAgentScripts { .. } => 1201,
            SimulationError::Cache(_) => 1401,
            SimulationError::DurableStore(_) => 1402,
            SimulationError::Persistence(_) => 1403,
            SimulationError::InvariantViolation(_) => 1501,
        }
    }
}

impl From<StoreError> for SimulationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SimulationError::NotFound(id),
            StoreError::Cache(msg) => SimulationError::Cache(msg),
            StoreError::Durable(msg) => SimulationError::DurableStore(msg),
            StoreError::Persistence(msg) => SimulationError::Persistence(msg),
            StoreError::Serialization(msg) => SimulationError::InvariantViolation(msg),
            StoreError::InvalidUpdate(e) => SimulationError::InvariantViolation(e.to_string()),
        }
    }
}

impl From<RegistryError> for SimulationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidScript(msg) => SimulationError::InvalidScript(msg),
            RegistryError::QuotaExceeded { .. } => SimulationError::QuotaExceeded(err.to_string()),
            RegistryError::ConflictingBinding { .. } => {
                SimulationError::ConflictingBinding(err.to_string())
            }
            RegistryError::ScriptNotFound(id) => SimulationError::NotFound(id),
            RegistryError::Store(e) => SimulationError::from(e),
        }
    }
}

/// Result of one `run_tick`.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub simulation_id: String,
    pub new_tick: u64,
    pub new_day: u64,
    pub logs: Vec<TickLogEntry>,
    pub macro_state: MacroState,
    /// Bindings whose script failed and fell back to the baseline.
    pub script_failures: u64,
}

/// Result of one `run_day`.
#[derive(Debug, Clone)]
pub struct DayResult {
    pub simulation_id: String,
    pub ticks_executed: u64,
    pub final_tick: u64,
    pub final_day: u64,
    pub macro_state: MacroState,
}

/// Summary returned by `create_simulation`.
#[derive(Debug, Clone)]
pub struct SimulationSummary {
    pub simulation_id: String,
    pub tick: u64,
    pub day: u64,
    pub num_households: u64,
    pub participants: Vec<String>,
}

struct SimEntry {
    config: WorldConfig,
    writer: tokio::sync::Mutex<()>,
    status: std::sync::Mutex<SimStatus>,
}

impl SimEntry {
    fn new(config: WorldConfig) -> Self {
        Self {
            config,
            writer: tokio::sync::Mutex::new(()),
            status: std::sync::Mutex::new(SimStatus::Ready),
        }
    }

    fn status(&self) -> SimStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    fn set_status(&self, status: SimStatus) {
        *self.status.lock().expect("status mutex poisoned") = status;
    }
}

/// The orchestration engine.
///
/// Explicitly constructed and wired at startup: store, registry and
/// sandbox are injected, nothing is process-global.
pub struct Orchestrator {
    default_config: WorldConfig,
    store: StateStore,
    registry: Arc<ScriptRegistry>,
    sandbox: Arc<SandboxExecutor>,
    sims: tokio::sync::Mutex<HashMap<String, Arc<SimEntry>>>,
}

impl Orchestrator {
    pub fn new(
        default_config: WorldConfig,
        store: StateStore,
        registry: Arc<ScriptRegistry>,
        sandbox: Arc<SandboxExecutor>,
    ) -> Result<Self, SimulationError> {
        default_config
            .validate()
            .map_err(SimulationError::InvalidConfig)?;
        Ok(Self {
            default_config,
            store,
            registry,
            sandbox,
            sims: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create (or idempotently return) a simulation.
    pub async fn create_simulation(
        &self,
        simulation_id: Option<String>,
        config: Option<WorldConfig>,
        initial_participant: Option<String>,
    ) -> Result<SimulationSummary, SimulationError> {
        let simulation_id =
            simulation_id.unwrap_or_else(|| format!("sim-{}", Uuid::new_v4().simple()));
        let config = config.unwrap_or_else(|| self.default_config.clone());
        config.validate().map_err(SimulationError::InvalidConfig)?;

        let entry = {
            let mut sims = self.sims.lock().await;
            sims.entry(simulation_id.clone())
                .or_insert_with(|| Arc::new(SimEntry::new(config.clone())))
                .clone()
        };

        let world = self
            .store
            .ensure_simulation(&simulation_id, &entry.config)
            .await?;

        if let Some(user_id) = initial_participant {
            self.store
                .register_participant(&simulation_id, &user_id)
                .await?;
        }
        let participants = self.store.list_participants(&simulation_id).await?;

        info!(simulation_id, tick = world.tick, "simulation ready");
        Ok(SimulationSummary {
            simulation_id,
            tick: world.tick,
            day: world.day,
            num_households: world.households.len() as u64,
            participants,
        })
    }

    /// Current world snapshot.
    pub async fn get_state(&self, simulation_id: &str) -> Result<WorldState, SimulationError> {
        Ok(self.store.get_world_state(simulation_id).await?)
    }

    /// Reset a simulation to its initial state. Script bindings survive.
    pub async fn reset_simulation(&self, simulation_id: &str) -> Result<(), SimulationError> {
        let entry = self.entry_for(simulation_id).await?;
        let _guard = entry.writer.lock().await;
        self.store.reset_simulation(simulation_id).await?;
        self.store
            .ensure_simulation(simulation_id, &entry.config)
            .await?;
        entry.set_status(SimStatus::Ready);
        info!(simulation_id, "simulation reset");
        Ok(())
    }

    /// Delete a simulation: world state and participants are removed,
    /// scripts are detached back into their owners' libraries.
    pub async fn delete_simulation(&self, simulation_id: &str) -> Result<(), SimulationError> {
        let entry = self.entry_for(simulation_id).await?;
        {
            let _guard = entry.writer.lock().await;
            self.store.delete_simulation(simulation_id).await?;
            let detached = self.registry.detach_simulation(simulation_id).await?;
            info!(simulation_id, detached, "simulation deleted");
        }
        let mut sims = self.sims.lock().await;
        sims.remove(simulation_id);
        Ok(())
    }

    pub async fn register_participant(
        &self,
        simulation_id: &str,
        user_id: &str,
    ) -> Result<(), SimulationError> {
        self.entry_for(simulation_id).await?;
        Ok(self
            .store
            .register_participant(simulation_id, user_id)
            .await?)
    }

    pub async fn list_participants(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<String>, SimulationError> {
        Ok(self.store.list_participants(simulation_id).await?)
    }

    /// Lifecycle state as seen by operators.
    pub async fn simulation_status(&self, simulation_id: &str) -> SimStatus {
        let sims = self.sims.lock().await;
        sims.get(simulation_id)
            .map(|e| e.status())
            .unwrap_or(SimStatus::Uninitialized)
    }

    // ========================================================================
    // Tick execution
    // ========================================================================

    /// Advance one tick.
    pub async fn run_tick(
        &self,
        simulation_id: &str,
        admin_overrides: Option<TickDecisionOverrides>,
    ) -> Result<TickResult, SimulationError> {
        let entry = self.entry_for(simulation_id).await?;
        let _guard = entry.writer.lock().await;

        match entry.status() {
            SimStatus::Failed | SimStatus::Locked => {
                return Err(SimulationError::SimulationLocked(simulation_id.to_string()))
            }
            _ => {}
        }
        entry.set_status(SimStatus::Advancing);

        let result = self
            .execute_tick(simulation_id, &entry, admin_overrides)
            .await;

        match &result {
            Ok(_) => entry.set_status(SimStatus::Ready),
            Err(err) => match err {
                // recoverable caller/user errors leave the simulation Ready
                SimulationError::MissingAgentScripts { .. }
                | SimulationError::NotFound(_)
                | SimulationError::InvalidOverride(_) => entry.set_status(SimStatus::Ready),
                // everything else that escapes the tick is fatal
                _ => {
                    error!(simulation_id, error = %err, "tick failed; freezing simulation");
                    entry.set_status(SimStatus::Failed);
                }
            },
        }
        result
    }

    async fn execute_tick(
        &self,
        simulation_id: &str,
        entry: &SimEntry,
        admin_overrides: Option<TickDecisionOverrides>,
    ) -> Result<TickResult, SimulationError> {
        let config = &entry.config;
        let world = self.store.get_world_state(simulation_id).await?;
        let clock = TickClock::for_next_tick(world.tick, config.simulation.ticks_per_day);

        // -- coverage guard -------------------------------------------------
        let bindings = self.registry.resolve_bindings(simulation_id).await?;
        let missing = missing_coverage(&world, &bindings);
        if !missing.is_empty() && !config.features.allow_fallback_for_missing {
            return Err(SimulationError::MissingAgentScripts {
                simulation_id: simulation_id.to_string(),
                missing,
            });
        }

        // -- sandbox dispatch ----------------------------------------------
        let (script_overrides, mut logs, failure_events) = self
            .dispatch_scripts(simulation_id, &world, config, clock, &bindings)
            .await;
        let script_failures = failure_events.len() as u64;

        // -- merge ----------------------------------------------------------
        let baseline = baseline_tick_decisions(&world, config);
        let outcome = merge_tick_decisions(
            simulation_id,
            clock,
            baseline,
            &script_overrides,
            admin_overrides.as_ref(),
        );
        logs.extend(outcome.warnings);

        // -- logic modules --------------------------------------------------
        let logic_outcome = logic::execute_tick(&world, &outcome.decisions, config, clock);
        logs.extend(logic_outcome.logs);

        let mut commands: Vec<StateUpdateCommand> = logic_outcome.commands;
        commands.push(StateUpdateCommand::assign(
            UpdateScope::World,
            "tick",
            clock.completed_tick(),
        ));
        commands.push(StateUpdateCommand::assign(
            UpdateScope::World,
            "day",
            clock.completed_day(),
        ));

        // -- atomic apply + logs -------------------------------------------
        let new_world = self
            .store
            .apply_updates(simulation_id, &commands, config)
            .await?;

        if let Err(violation) = new_world.check_invariants() {
            return Err(SimulationError::InvariantViolation(violation));
        }
        if new_world.day != new_world.tick / config.simulation.ticks_per_day {
            return Err(SimulationError::InvariantViolation(format!(
                "day {} does not match tick {} at {} ticks per day",
                new_world.day, new_world.tick, config.simulation.ticks_per_day
            )));
        }

        self.store.record_tick(simulation_id, &logs).await?;

        // failure bookkeeping is best-effort and must not fail the tick
        let recovered: Vec<String> = bindings
            .values()
            .filter(|b| !failure_events.iter().any(|f| f.script_id == b.script_id))
            .map(|b| b.script_id.clone())
            .collect();
        self.registry
            .record_failures(&failure_events, &recovered)
            .await;

        info!(
            simulation_id,
            tick = new_world.tick,
            day = new_world.day,
            script_failures,
            "tick completed"
        );

        Ok(TickResult {
            simulation_id: simulation_id.to_string(),
            new_tick: new_world.tick,
            new_day: new_world.day,
            logs,
            macro_state: new_world.macro_state,
            script_failures,
        })
    }

    /// Dispatch every binding concurrently and collect scoped overrides,
    /// failure logs and failure events.
    async fn dispatch_scripts(
        &self,
        simulation_id: &str,
        world: &WorldState,
        config: &WorldConfig,
        clock: TickClock,
        bindings: &BTreeMap<(AgentKind, String), ResolvedBinding>,
    ) -> (
        Vec<TickDecisionOverrides>,
        Vec<TickLogEntry>,
        Vec<ScriptFailureEvent>,
    ) {
        let mut handles = Vec::new();
        for ((kind, entity_id), binding) in bindings {
            let context = match trim_context(world, config, *kind, entity_id) {
                Some(context) => context,
                None => {
                    warn!(
                        simulation_id,
                        entity_id = %entity_id,
                        "binding references an entity absent from the world"
                    );
                    continue;
                }
            };
            let job = ScriptJob {
                code: binding.code.clone(),
                code_version: binding.code_version.clone(),
                context,
            };
            let sandbox = Arc::clone(&self.sandbox);
            let key = (*kind, entity_id.clone());
            let binding = binding.clone();
            handles.push(tokio::spawn(async move {
                let result = sandbox.execute(&job).await;
                (key, binding, result)
            }));
        }

        let mut overrides = Vec::new();
        let mut logs = Vec::new();
        let mut failures = Vec::new();

        for handle in handles {
            let ((kind, entity_id), binding, result) = match handle.await {
                Ok(output) => output,
                Err(join_err) => {
                    error!(simulation_id, error = %join_err, "sandbox task panicked");
                    continue;
                }
            };
            match result {
                Ok(value) => match serde_json::from_value::<TickDecisionOverrides>(value) {
                    Ok(raw) => {
                        let (scoped, dropped) = scope_script_override(kind, &entity_id, raw);
                        for field in dropped {
                            logs.push(
                                TickLogEntry::new(
                                    simulation_id,
                                    clock.tick_index(),
                                    clock.day(),
                                    "override_out_of_scope",
                                )
                                .with("agent_kind", kind.as_str())
                                .with("entity_id", entity_id.clone())
                                .with("field", field),
                            );
                        }
                        overrides.push(scoped);
                    }
                    Err(parse_err) => {
                        // schema violation: treat as a script failure and
                        // fall back to the baseline for this binding
                        let event = ScriptFailureEvent {
                            script_id: binding.script_id.clone(),
                            simulation_id: simulation_id.to_string(),
                            user_id: binding.user_id.clone(),
                            agent_kind: kind,
                            entity_id: entity_id.clone(),
                            kind: FailureKind::InvalidReturn,
                            message: format!("override schema violation: {parse_err}"),
                            trace: String::new(),
                            tick: clock.tick_index(),
                        };
                        logs.push(failure_log(simulation_id, clock, &event));
                        failures.push(event);
                    }
                },
                Err(failure) => {
                    let event = ScriptFailureEvent {
                        script_id: binding.script_id.clone(),
                        simulation_id: simulation_id.to_string(),
                        user_id: binding.user_id.clone(),
                        agent_kind: kind,
                        entity_id: entity_id.clone(),
                        kind: failure.kind,
                        message: failure.message,
                        trace: failure.trace,
                        tick: clock.tick_index(),
                    };
                    logs.push(failure_log(simulation_id, clock, &event));
                    failures.push(event);
                }
            }
        }
        (overrides, logs, failures)
    }

    /// Advance up to a day: stops at the day boundary or after
    /// `ticks_in_day` ticks, whichever comes first, then fires the
    /// registry's day-end hook.
    pub async fn run_day(
        &self,
        simulation_id: &str,
        ticks_in_day: Option<u64>,
    ) -> Result<DayResult, SimulationError> {
        let entry = self.entry_for(simulation_id).await?;
        let quota = ticks_in_day.unwrap_or(entry.config.simulation.ticks_per_day);

        let mut executed = 0u64;
        let mut last: Option<TickResult> = None;
        while executed < quota {
            let result = self.run_tick(simulation_id, None).await?;
            executed += 1;
            let crossed =
                result.new_tick % entry.config.simulation.ticks_per_day == 0;
            last = Some(result);
            if crossed {
                break;
            }
        }

        let last = last.ok_or_else(|| {
            SimulationError::InvalidConfig("run_day requires at least one tick".to_string())
        })?;

        if at_day_boundary(last.new_tick, entry.config.simulation.ticks_per_day) {
            self.registry.on_day_end(simulation_id, last.new_day).await;
        }

        Ok(DayResult {
            simulation_id: simulation_id.to_string(),
            ticks_executed: executed,
            final_tick: last.new_tick,
            final_day: last.new_day,
            macro_state: last.macro_state,
        })
    }

    // ========================================================================
    // Script operations (registry facade)
    // ========================================================================

    pub async fn register_script(
        &self,
        user_id: &str,
        code: &str,
        agent_kind: AgentKind,
        entity_id: Option<String>,
        simulation_id: Option<String>,
        description: Option<String>,
    ) -> Result<ScriptMetadata, SimulationError> {
        Ok(self
            .registry
            .register_script(user_id, code, agent_kind, entity_id, simulation_id, description)
            .await?)
    }

    pub async fn attach_script(
        &self,
        script_id: &str,
        user_id: &str,
        simulation_id: &str,
        entity_id: Option<String>,
    ) -> Result<ScriptMetadata, SimulationError> {
        Ok(self
            .registry
            .attach_script(script_id, user_id, simulation_id, entity_id)
            .await?)
    }

    pub async fn detach_script(
        &self,
        script_id: &str,
        user_id: &str,
    ) -> Result<ScriptMetadata, SimulationError> {
        Ok(self.registry.detach_script(script_id, user_id).await?)
    }

    pub async fn delete_script(
        &self,
        script_id: &str,
        user_id: &str,
    ) -> Result<(), SimulationError> {
        Ok(self.registry.delete_script(script_id, user_id).await?)
    }

    pub async fn list_user_scripts(
        &self,
        user_id: &str,
    ) -> Result<Vec<ScriptMetadata>, SimulationError> {
        Ok(self.registry.list_user_scripts(user_id).await?)
    }

    pub async fn list_simulation_scripts(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<ScriptMetadata>, SimulationError> {
        Ok(self.registry.list_simulation_scripts(simulation_id).await?)
    }

    /// Replace a bound script's code. Permitted only while its simulation
    /// sits on a day boundary; unbound library scripts update freely.
    pub async fn update_script_code(
        &self,
        script_id: &str,
        user_id: &str,
        new_code: &str,
        new_description: Option<String>,
    ) -> Result<ScriptMetadata, SimulationError> {
        if let Some(metadata) = self.registry.get_script(script_id).await {
            if let Some(simulation_id) = &metadata.simulation_id {
                let entry = self.entry_for(simulation_id).await?;
                let world = self.store.get_world_state(simulation_id).await?;
                if !at_day_boundary(world.tick, entry.config.simulation.ticks_per_day) {
                    return Err(SimulationError::NotAtDayBoundary {
                        simulation_id: simulation_id.clone(),
                        tick: world.tick,
                    });
                }
            }
        }
        Ok(self
            .registry
            .update_script_code(script_id, Some(user_id), new_code, new_description)
            .await?)
    }

    /// Tick-log query over the durable tier.
    pub async fn list_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> Result<Vec<TickLogEntry>, SimulationError> {
        Ok(self.store.list_tick_logs(simulation_id, query).await?)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn entry_for(&self, simulation_id: &str) -> Result<Arc<SimEntry>, SimulationError> {
        {
            let sims = self.sims.lock().await;
            if let Some(entry) = sims.get(simulation_id) {
                return Ok(entry.clone());
            }
        }
        // a restart may have dropped the entry while the store still
        // knows the world; rebuild with the default config
        match self.store.get_world_state(simulation_id).await {
            Ok(_) => {
                let mut sims = self.sims.lock().await;
                Ok(sims
                    .entry(simulation_id.to_string())
                    .or_insert_with(|| Arc::new(SimEntry::new(self.default_config.clone())))
                    .clone())
            }
            Err(StoreError::NotFound(id)) => Err(SimulationError::NotFound(id)),
            Err(other) => Err(other.into()),
        }
    }
}

/// Coverage: every singleton kind needs a binding, every household its
/// own. Returns the missing agents, empty when fully covered.
fn missing_coverage(
    world: &WorldState,
    bindings: &BTreeMap<(AgentKind, String), ResolvedBinding>,
) -> Vec<String> {
    let mut missing = Vec::new();
    for kind in AgentKind::singletons() {
        let covered = bindings.keys().any(|(k, _)| *k == kind);
        if !covered {
            missing.push(kind.as_str().to_string());
        }
    }
    for id in world.households.keys() {
        if !bindings.contains_key(&(AgentKind::Household, id.clone())) {
            missing.push(format!("household:{id}"));
        }
    }
    missing
}

fn failure_log(
    simulation_id: &str,
    clock: TickClock,
    event: &ScriptFailureEvent,
) -> TickLogEntry {
    TickLogEntry::new(
        simulation_id,
        clock.tick_index(),
        clock.day(),
        "script_failure",
    )
    .with("script_id", event.script_id.clone())
    .with("agent_kind", event.agent_kind.as_str())
    .with("entity_id", event.entity_id.clone())
    .with("user_id", event.user_id.clone())
    .with("kind", event.kind.to_string())
    .with("message", event.message.clone())
}
