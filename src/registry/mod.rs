//! Script registry
//!
//! Catalog of user-uploaded scripts and their bindings to
//! `(simulation_id, agent_kind, entity_id)` triples. The in-memory index
//! is protected by a single registry-wide lock; binding availability
//! checks and index updates happen under that lock, and a failed durable
//! write rolls the in-memory change back before the lock is released.
//! This is the property that makes concurrent attaches safe: at most one
//! script ever holds a triple.

pub mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::AgentKind;
use crate::sandbox::FailureKind;
use crate::store::StoreError;

pub use validate::{validate_source, ALLOWED_MODULES};

const PENDING_ENTITY_PREFIX: &str = "pending:";

/// Script metadata as stored and listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    pub script_id: String,
    /// None = unbound personal-library script.
    pub simulation_id: Option<String>,
    pub user_id: String,
    pub agent_kind: AgentKind,
    pub entity_id: String,
    pub description: Option<String>,
    /// Regenerated only when the code changes; invalidates any cached
    /// compilation artifacts downstream.
    pub code_version: String,
    pub last_failure_tick: Option<u64>,
    pub last_failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Metadata plus source, as returned by the durable tier.
#[derive(Debug, Clone)]
pub struct StoredScript {
    pub metadata: ScriptMetadata,
    pub code: String,
}

/// One script execution failure, recorded per binding per tick.
#[derive(Debug, Clone)]
pub struct ScriptFailureEvent {
    pub script_id: String,
    pub simulation_id: String,
    pub user_id: String,
    pub agent_kind: AgentKind,
    pub entity_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
    pub tick: u64,
}

/// Binding resolved for one tick's dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    pub script_id: String,
    pub user_id: String,
    pub code_version: String,
    pub code: String,
}

/// Durable persistence operations the registry writes through to.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn save_script(&self, metadata: &ScriptMetadata, code: &str) -> Result<(), StoreError>;
    async fn fetch_simulation_scripts(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<StoredScript>, StoreError>;
    async fn fetch_user_scripts(&self, user_id: &str) -> Result<Vec<StoredScript>, StoreError>;
    async fn delete_script(&self, script_id: &str) -> Result<bool, StoreError>;
    async fn detach_simulation(&self, simulation_id: &str) -> Result<Vec<String>, StoreError>;
    async fn set_script_limit(&self, simulation_id: &str, limit: u64) -> Result<(), StoreError>;
    async fn get_script_limit(&self, simulation_id: &str) -> Result<Option<u64>, StoreError>;
    async fn delete_script_limit(&self, simulation_id: &str) -> Result<(), StoreError>;
    async fn update_failure_status(
        &self,
        script_id: &str,
        failure_tick: Option<u64>,
        failure_reason: Option<String>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid script: {0}")]
    InvalidScript(String),

    #[error("script quota reached: user {user_id} may bind at most {limit} scripts in simulation {simulation_id}")]
    QuotaExceeded {
        user_id: String,
        simulation_id: String,
        limit: u64,
    },

    #[error("binding already taken: simulation={simulation_id} agent_kind={agent_kind} entity_id={entity_id}")]
    ConflictingBinding {
        simulation_id: String,
        agent_kind: AgentKind,
        entity_id: String,
    },

    #[error("script '{0}' not found or not owned by caller")]
    ScriptNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct ScriptRecord {
    metadata: ScriptMetadata,
    code: String,
}

#[derive(Default)]
struct RegistryIndex {
    records: HashMap<String, ScriptRecord>,
    /// `(simulation_id, agent_kind, entity_id)` → script_id
    entity_index: HashMap<(String, AgentKind, String), String>,
    simulation_index: HashMap<String, BTreeSet<String>>,
    user_index: HashMap<String, BTreeSet<String>>,
    simulation_limits: HashMap<String, u64>,
    loaded_simulations: HashSet<String>,
    loaded_users: HashSet<String>,
}

impl RegistryIndex {
    fn link(&mut self, metadata: &ScriptMetadata) {
        self.user_index
            .entry(metadata.user_id.clone())
            .or_default()
            .insert(metadata.script_id.clone());
        if let Some(sim) = &metadata.simulation_id {
            self.simulation_index
                .entry(sim.clone())
                .or_default()
                .insert(metadata.script_id.clone());
            self.entity_index.insert(
                (sim.clone(), metadata.agent_kind, metadata.entity_id.clone()),
                metadata.script_id.clone(),
            );
        }
    }

    fn unlink(&mut self, metadata: &ScriptMetadata) {
        if let Some(bucket) = self.user_index.get_mut(&metadata.user_id) {
            bucket.remove(&metadata.script_id);
            if bucket.is_empty() {
                self.user_index.remove(&metadata.user_id);
            }
        }
        if let Some(sim) = &metadata.simulation_id {
            if let Some(bucket) = self.simulation_index.get_mut(sim) {
                bucket.remove(&metadata.script_id);
                if bucket.is_empty() {
                    self.simulation_index.remove(sim);
                }
            }
            let key = (sim.clone(), metadata.agent_kind, metadata.entity_id.clone());
            if self.entity_index.get(&key) == Some(&metadata.script_id) {
                self.entity_index.remove(&key);
            }
        }
    }

    fn count_user_scripts(&self, simulation_id: &str, user_id: &str) -> u64 {
        self.simulation_index
            .get(simulation_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.records
                            .get(*id)
                            .map(|r| r.metadata.user_id == user_id)
                            .unwrap_or(false)
                    })
                    .count() as u64
            })
            .unwrap_or(0)
    }

    /// Binding availability for a triple, plus the one-per-kind rule for
    /// singleton agents.
    fn ensure_available(
        &self,
        simulation_id: &str,
        agent_kind: AgentKind,
        entity_id: &str,
        ignore_script_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let key = (simulation_id.to_string(), agent_kind, entity_id.to_string());
        if let Some(existing) = self.entity_index.get(&key) {
            if Some(existing.as_str()) != ignore_script_id {
                return Err(RegistryError::ConflictingBinding {
                    simulation_id: simulation_id.to_string(),
                    agent_kind,
                    entity_id: entity_id.to_string(),
                });
            }
        }
        if agent_kind != AgentKind::Household {
            if let Some(bound) = self.simulation_index.get(simulation_id) {
                for script_id in bound {
                    if Some(script_id.as_str()) == ignore_script_id {
                        continue;
                    }
                    if let Some(record) = self.records.get(script_id) {
                        if record.metadata.agent_kind == agent_kind {
                            return Err(RegistryError::ConflictingBinding {
                                simulation_id: simulation_id.to_string(),
                                agent_kind,
                                entity_id: entity_id.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Default entity id a singleton-kind script binds to.
pub fn canonical_singleton_id(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Household => "",
        AgentKind::Firm => "firm_1",
        AgentKind::Bank => "bank",
        AgentKind::CentralBank => "central_bank",
        AgentKind::Government => "government",
    }
}

fn is_placeholder(entity_id: &str) -> bool {
    entity_id.starts_with(PENDING_ENTITY_PREFIX)
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The registry itself.
pub struct ScriptRegistry {
    index: Mutex<RegistryIndex>,
    store: Option<Arc<dyn ScriptStore>>,
    default_limit: Option<u64>,
}

impl ScriptRegistry {
    pub fn new(store: Option<Arc<dyn ScriptStore>>, default_limit: Option<u64>) -> Self {
        Self {
            index: Mutex::new(RegistryIndex::default()),
            store,
            default_limit,
        }
    }

    /// Register a new script, optionally bound to a simulation.
    pub async fn register_script(
        &self,
        user_id: &str,
        code: &str,
        agent_kind: AgentKind,
        entity_id: Option<String>,
        simulation_id: Option<String>,
        description: Option<String>,
    ) -> Result<ScriptMetadata, RegistryError> {
        validate_source(code).map_err(RegistryError::InvalidScript)?;

        let entity_id = match entity_id {
            Some(id) => {
                let id = id.trim().to_string();
                if id.is_empty() {
                    return Err(RegistryError::InvalidScript(
                        "entity_id must not be empty".to_string(),
                    ));
                }
                id
            }
            None => match agent_kind {
                AgentKind::Household => format!(
                    "{PENDING_ENTITY_PREFIX}{}:{}",
                    agent_kind.as_str(),
                    Uuid::new_v4().simple()
                ),
                other => canonical_singleton_id(other).to_string(),
            },
        };

        if simulation_id.is_some() {
            validate_binding_entity(agent_kind, &entity_id)?;
        }

        if let Some(sim) = &simulation_id {
            self.ensure_simulation_loaded(sim).await?;
        }
        self.ensure_user_loaded(user_id).await?;

        let now = now_epoch();
        let metadata = ScriptMetadata {
            script_id: Uuid::new_v4().to_string(),
            simulation_id: simulation_id.clone(),
            user_id: user_id.to_string(),
            agent_kind,
            entity_id,
            description,
            code_version: Uuid::new_v4().to_string(),
            last_failure_tick: None,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut index = self.index.lock().await;
        if let Some(sim) = &simulation_id {
            let limit = self.effective_limit_locked(&index, sim);
            if let Some(limit) = limit {
                if index.count_user_scripts(sim, user_id) >= limit {
                    return Err(RegistryError::QuotaExceeded {
                        user_id: user_id.to_string(),
                        simulation_id: sim.clone(),
                        limit,
                    });
                }
            }
            index.ensure_available(sim, agent_kind, &metadata.entity_id, None)?;
        }

        index.records.insert(
            metadata.script_id.clone(),
            ScriptRecord {
                metadata: metadata.clone(),
                code: code.to_string(),
            },
        );
        index.link(&metadata);

        if let Some(store) = &self.store {
            if let Err(err) = store.save_script(&metadata, code).await {
                // roll back before the lock is released
                index.unlink(&metadata);
                index.records.remove(&metadata.script_id);
                return Err(err.into());
            }
        }
        Ok(metadata)
    }

    /// Attach a personal-library script to a simulation.
    ///
    /// Availability check and index update happen under the registry
    /// lock; a durable failure rolls the index back before release.
    pub async fn attach_script(
        &self,
        script_id: &str,
        user_id: &str,
        simulation_id: &str,
        entity_id: Option<String>,
    ) -> Result<ScriptMetadata, RegistryError> {
        self.ensure_user_loaded(user_id).await?;
        self.ensure_simulation_loaded(simulation_id).await?;

        let mut index = self.index.lock().await;
        let record = index
            .records
            .get(script_id)
            .filter(|r| r.metadata.user_id == user_id)
            .cloned()
            .ok_or_else(|| RegistryError::ScriptNotFound(script_id.to_string()))?;

        if record.metadata.simulation_id.as_deref() == Some(simulation_id) {
            return Ok(record.metadata);
        }
        if let Some(other) = &record.metadata.simulation_id {
            return Err(RegistryError::InvalidScript(format!(
                "script {script_id} is already attached to simulation {other}"
            )));
        }

        let candidate_entity = match entity_id {
            Some(id) => id,
            None if is_placeholder(&record.metadata.entity_id) => {
                return Err(RegistryError::InvalidScript(
                    "entity_id required: script has no finalized entity binding".to_string(),
                ))
            }
            None => record.metadata.entity_id.clone(),
        };
        validate_binding_entity(record.metadata.agent_kind, &candidate_entity)?;

        if let Some(limit) = self.effective_limit_locked(&index, simulation_id) {
            if index.count_user_scripts(simulation_id, user_id) >= limit {
                return Err(RegistryError::QuotaExceeded {
                    user_id: user_id.to_string(),
                    simulation_id: simulation_id.to_string(),
                    limit,
                });
            }
        }
        index.ensure_available(
            simulation_id,
            record.metadata.agent_kind,
            &candidate_entity,
            Some(script_id),
        )?;

        let old_metadata = record.metadata.clone();
        let mut new_metadata = record.metadata;
        new_metadata.simulation_id = Some(simulation_id.to_string());
        new_metadata.entity_id = candidate_entity;
        new_metadata.updated_at = now_epoch();

        index.unlink(&old_metadata);
        if let Some(rec) = index.records.get_mut(script_id) {
            rec.metadata = new_metadata.clone();
        }
        index.link(&new_metadata);

        if let Some(store) = &self.store {
            if let Err(err) = store.save_script(&new_metadata, &record.code).await {
                index.unlink(&new_metadata);
                if let Some(rec) = index.records.get_mut(script_id) {
                    rec.metadata = old_metadata.clone();
                }
                index.link(&old_metadata);
                return Err(err.into());
            }
        }
        Ok(new_metadata)
    }

    /// Detach a script from its simulation, keeping the entity binding so
    /// a later attach restores the previous state.
    pub async fn detach_script(
        &self,
        script_id: &str,
        user_id: &str,
    ) -> Result<ScriptMetadata, RegistryError> {
        self.ensure_user_loaded(user_id).await?;

        let mut index = self.index.lock().await;
        let record = index
            .records
            .get(script_id)
            .filter(|r| r.metadata.user_id == user_id)
            .cloned()
            .ok_or_else(|| RegistryError::ScriptNotFound(script_id.to_string()))?;

        if record.metadata.simulation_id.is_none() {
            return Ok(record.metadata);
        }

        let old_metadata = record.metadata.clone();
        let mut new_metadata = record.metadata;
        new_metadata.simulation_id = None;
        new_metadata.updated_at = now_epoch();

        index.unlink(&old_metadata);
        if let Some(rec) = index.records.get_mut(script_id) {
            rec.metadata = new_metadata.clone();
        }
        index.link(&new_metadata);

        if let Some(store) = &self.store {
            if let Err(err) = store.save_script(&new_metadata, &record.code).await {
                index.unlink(&new_metadata);
                if let Some(rec) = index.records.get_mut(script_id) {
                    rec.metadata = old_metadata.clone();
                }
                index.link(&old_metadata);
                return Err(err.into());
            }
        }
        Ok(new_metadata)
    }

    /// Delete a script the caller owns, bound or not.
    pub async fn delete_script(&self, script_id: &str, user_id: &str) -> Result<(), RegistryError> {
        self.ensure_user_loaded(user_id).await?;

        let mut index = self.index.lock().await;
        let record = index
            .records
            .get(script_id)
            .filter(|r| r.metadata.user_id == user_id)
            .cloned()
            .ok_or_else(|| RegistryError::ScriptNotFound(script_id.to_string()))?;

        index.unlink(&record.metadata);
        index.records.remove(script_id);

        if let Some(store) = &self.store {
            if let Err(err) = store.delete_script(script_id).await {
                index.records.insert(script_id.to_string(), record.clone());
                index.link(&record.metadata);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Delete every script a user owns. Returns how many were removed.
    pub async fn remove_scripts_by_user(&self, user_id: &str) -> Result<usize, RegistryError> {
        self.ensure_user_loaded(user_id).await?;

        let mut index = self.index.lock().await;
        let ids: Vec<String> = index
            .user_index
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for script_id in &ids {
            if let Some(record) = index.records.remove(script_id) {
                index.unlink(&record.metadata);
                removed += 1;
            }
        }
        drop(index);

        if let Some(store) = &self.store {
            for script_id in &ids {
                if let Err(err) = store.delete_script(script_id).await {
                    warn!(%script_id, error = %err, "failed to delete user script durably");
                }
            }
        }
        Ok(removed)
    }

    /// Replace a script's code, bumping `code_version` while keeping the
    /// binding (used by the day-end rotation hook).
    pub async fn update_script_code(
        &self,
        script_id: &str,
        user_id: Option<&str>,
        new_code: &str,
        new_description: Option<String>,
    ) -> Result<ScriptMetadata, RegistryError> {
        validate_source(new_code).map_err(RegistryError::InvalidScript)?;

        let mut index = self.index.lock().await;
        let record = index
            .records
            .get(script_id)
            .filter(|r| user_id.is_none() || Some(r.metadata.user_id.as_str()) == user_id)
            .cloned()
            .ok_or_else(|| RegistryError::ScriptNotFound(script_id.to_string()))?;

        let old = record.clone();
        let mut new_metadata = record.metadata;
        new_metadata.code_version = Uuid::new_v4().to_string();
        new_metadata.updated_at = now_epoch();
        if new_description.is_some() {
            new_metadata.description = new_description;
        }

        if let Some(rec) = index.records.get_mut(script_id) {
            rec.metadata = new_metadata.clone();
            rec.code = new_code.to_string();
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.save_script(&new_metadata, new_code).await {
                if let Some(rec) = index.records.get_mut(script_id) {
                    *rec = old;
                }
                return Err(err.into());
            }
        }
        Ok(new_metadata)
    }

    pub async fn list_user_scripts(
        &self,
        user_id: &str,
    ) -> Result<Vec<ScriptMetadata>, RegistryError> {
        self.ensure_user_loaded(user_id).await?;
        let index = self.index.lock().await;
        let mut scripts: Vec<ScriptMetadata> = index
            .user_index
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.records.get(id).map(|r| r.metadata.clone()))
                    .collect()
            })
            .unwrap_or_default();
        scripts.sort_by(|a, b| (a.created_at, &a.script_id).cmp(&(b.created_at, &b.script_id)));
        Ok(scripts)
    }

    pub async fn list_simulation_scripts(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<ScriptMetadata>, RegistryError> {
        self.ensure_simulation_loaded(simulation_id).await?;
        let index = self.index.lock().await;
        let mut scripts: Vec<ScriptMetadata> = index
            .simulation_index
            .get(simulation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.records.get(id).map(|r| r.metadata.clone()))
                    .collect()
            })
            .unwrap_or_default();
        scripts.sort_by(|a, b| (a.created_at, &a.script_id).cmp(&(b.created_at, &b.script_id)));
        Ok(scripts)
    }

    /// Bindings for one tick's dispatch, keyed by `(agent_kind, entity_id)`.
    pub async fn resolve_bindings(
        &self,
        simulation_id: &str,
    ) -> Result<BTreeMap<(AgentKind, String), ResolvedBinding>, RegistryError> {
        self.ensure_simulation_loaded(simulation_id).await?;
        let index = self.index.lock().await;
        let mut bindings = BTreeMap::new();
        if let Some(ids) = index.simulation_index.get(simulation_id) {
            for id in ids {
                if let Some(record) = index.records.get(id) {
                    bindings.insert(
                        (record.metadata.agent_kind, record.metadata.entity_id.clone()),
                        ResolvedBinding {
                            script_id: record.metadata.script_id.clone(),
                            user_id: record.metadata.user_id.clone(),
                            code_version: record.metadata.code_version.clone(),
                            code: record.code.clone(),
                        },
                    );
                }
            }
        }
        Ok(bindings)
    }

    /// Unbind every script of a deleted simulation. Returns the count.
    pub async fn detach_simulation(&self, simulation_id: &str) -> Result<usize, RegistryError> {
        self.ensure_simulation_loaded(simulation_id).await?;

        if let Some(store) = &self.store {
            if let Err(err) = store.detach_simulation(simulation_id).await {
                error!(simulation_id, error = %err, "durable detach failed");
                return Err(err.into());
            }
            if let Err(err) = store.delete_script_limit(simulation_id).await {
                warn!(simulation_id, error = %err, "failed to delete script limit");
            }
        }

        let mut index = self.index.lock().await;
        let ids: Vec<String> = index
            .simulation_index
            .get(simulation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for script_id in &ids {
            if let Some(record) = index.records.get(script_id).cloned() {
                let mut new_metadata = record.metadata.clone();
                new_metadata.simulation_id = None;
                index.unlink(&record.metadata);
                if let Some(rec) = index.records.get_mut(script_id) {
                    rec.metadata = new_metadata.clone();
                }
                index.link(&new_metadata);
            }
        }
        index.simulation_index.remove(simulation_id);
        index.loaded_simulations.remove(simulation_id);
        index.simulation_limits.remove(simulation_id);
        Ok(ids.len())
    }

    /// Set (or clear with None) the per-simulation script limit.
    pub async fn set_simulation_limit(
        &self,
        simulation_id: &str,
        limit: Option<u64>,
    ) -> Result<(), RegistryError> {
        {
            let mut index = self.index.lock().await;
            match limit {
                Some(n) => {
                    index.simulation_limits.insert(simulation_id.to_string(), n);
                }
                None => {
                    index.simulation_limits.remove(simulation_id);
                }
            }
        }
        if let Some(store) = &self.store {
            match limit {
                Some(n) => store.set_script_limit(simulation_id, n).await?,
                None => store.delete_script_limit(simulation_id).await?,
            }
        }
        Ok(())
    }

    /// Persist failure status after a tick: failed bindings get a reason,
    /// previously-failed bindings that just ran clean are cleared.
    pub async fn record_failures(
        &self,
        failures: &[ScriptFailureEvent],
        ran_clean_script_ids: &[String],
    ) {
        let mut cleared = Vec::new();
        {
            let mut index = self.index.lock().await;
            for event in failures {
                if let Some(rec) = index.records.get_mut(&event.script_id) {
                    rec.metadata.last_failure_tick = Some(event.tick);
                    rec.metadata.last_failure_reason = Some(event.message.clone());
                }
            }
            for script_id in ran_clean_script_ids {
                if let Some(rec) = index.records.get_mut(script_id) {
                    if rec.metadata.last_failure_tick.is_some()
                        || rec.metadata.last_failure_reason.is_some()
                    {
                        rec.metadata.last_failure_tick = None;
                        rec.metadata.last_failure_reason = None;
                        cleared.push(script_id.clone());
                    }
                }
            }
        }
        if let Some(store) = &self.store {
            for event in failures {
                if let Err(err) = store
                    .update_failure_status(
                        &event.script_id,
                        Some(event.tick),
                        Some(event.message.clone()),
                    )
                    .await
                {
                    warn!(script_id = %event.script_id, error = %err,
                        "failed to persist script failure status");
                }
            }
            for script_id in &cleared {
                if let Err(err) = store.update_failure_status(script_id, None, None).await {
                    warn!(%script_id, error = %err, "failed to clear script failure status");
                }
            }
        }
    }

    /// Metadata lookup by id, no ownership check (internal facades
    /// enforce their own authorization).
    pub async fn get_script(&self, script_id: &str) -> Option<ScriptMetadata> {
        let index = self.index.lock().await;
        index.records.get(script_id).map(|r| r.metadata.clone())
    }

    /// Day-end hook fired by the orchestrator after a day boundary is
    /// reached. Reconciles the simulation's script limit with the
    /// durable tier; code rotation itself needs no hook since the
    /// boundary gate is positional.
    pub async fn on_day_end(&self, simulation_id: &str, day: u64) {
        if let Some(store) = &self.store {
            match store.get_script_limit(simulation_id).await {
                Ok(Some(limit)) => {
                    let mut index = self.index.lock().await;
                    index.simulation_limits.insert(simulation_id.to_string(), limit);
                }
                Ok(None) => {
                    let mut index = self.index.lock().await;
                    index.simulation_limits.remove(simulation_id);
                }
                Err(err) => {
                    warn!(simulation_id, error = %err, "day-end limit reconciliation failed");
                }
            }
        }
        tracing::debug!(simulation_id, day, "registry day-end hook complete");
    }

    fn effective_limit_locked(&self, index: &RegistryIndex, simulation_id: &str) -> Option<u64> {
        index
            .simulation_limits
            .get(simulation_id)
            .copied()
            .or(self.default_limit)
    }

    async fn ensure_simulation_loaded(&self, simulation_id: &str) -> Result<(), RegistryError> {
        {
            let index = self.index.lock().await;
            if index.loaded_simulations.contains(simulation_id) {
                return Ok(());
            }
        }
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => {
                let mut index = self.index.lock().await;
                index.loaded_simulations.insert(simulation_id.to_string());
                return Ok(());
            }
        };
        let stored = store.fetch_simulation_scripts(simulation_id).await?;
        let limit = store.get_script_limit(simulation_id).await?;
        let mut index = self.index.lock().await;
        self.ingest_locked(&mut index, stored);
        if let Some(limit) = limit {
            index.simulation_limits.insert(simulation_id.to_string(), limit);
        }
        index.loaded_simulations.insert(simulation_id.to_string());
        Ok(())
    }

    async fn ensure_user_loaded(&self, user_id: &str) -> Result<(), RegistryError> {
        {
            let index = self.index.lock().await;
            if index.loaded_users.contains(user_id) {
                return Ok(());
            }
        }
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => {
                let mut index = self.index.lock().await;
                index.loaded_users.insert(user_id.to_string());
                return Ok(());
            }
        };
        let stored = store.fetch_user_scripts(user_id).await?;
        let mut index = self.index.lock().await;
        self.ingest_locked(&mut index, stored);
        index.loaded_users.insert(user_id.to_string());
        Ok(())
    }

    fn ingest_locked(&self, index: &mut RegistryIndex, stored: Vec<StoredScript>) {
        for script in stored {
            let script_id = script.metadata.script_id.clone();
            if let Some(existing) = index.records.get(&script_id) {
                if existing.metadata.code_version == script.metadata.code_version {
                    continue;
                }
            }
            if let Err(err) = validate_source(&script.code) {
                warn!(%script_id, error = %err, "skipping persisted script that fails validation");
                continue;
            }
            if let Some(existing) = index.records.get(&script_id).map(|r| r.metadata.clone()) {
                index.unlink(&existing);
            }
            index.records.insert(
                script_id,
                ScriptRecord {
                    metadata: script.metadata.clone(),
                    code: script.code,
                },
            );
            index.link(&script.metadata);
        }
    }
}

fn validate_binding_entity(agent_kind: AgentKind, entity_id: &str) -> Result<(), RegistryError> {
    if is_placeholder(entity_id) {
        return Err(RegistryError::InvalidScript(
            "entity_id must be finalized before binding".to_string(),
        ));
    }
    if agent_kind == AgentKind::Household && !entity_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(RegistryError::InvalidScript(
            "household scripts require a decimal-digit entity_id".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &str = "def generate_decisions(context):\n    return {}\n";

    fn registry() -> ScriptRegistry {
        ScriptRegistry::new(None, None)
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let reg = registry();
        let meta = reg
            .register_script(
                "alice",
                CODE,
                AgentKind::Household,
                Some("000".to_string()),
                Some("sim-1".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(meta.simulation_id.as_deref(), Some("sim-1"));

        let listed = reg.list_simulation_scripts("sim-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].script_id, meta.script_id);
    }

    #[tokio::test]
    async fn test_conflicting_binding_rejected() {
        let reg = registry();
        reg.register_script(
            "alice",
            CODE,
            AgentKind::Household,
            Some("000".to_string()),
            Some("sim-1".to_string()),
            None,
        )
        .await
        .unwrap();

        let err = reg
            .register_script(
                "bob",
                CODE,
                AgentKind::Household,
                Some("000".to_string()),
                Some("sim-1".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConflictingBinding { .. }));
    }

    #[tokio::test]
    async fn test_one_singleton_script_per_kind() {
        let reg = registry();
        reg.register_script("alice", CODE, AgentKind::Firm, None, Some("sim-1".into()), None)
            .await
            .unwrap();
        let err = reg
            .register_script("bob", CODE, AgentKind::Firm, None, Some("sim-1".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConflictingBinding { .. }));
    }

    #[tokio::test]
    async fn test_attach_then_detach_round_trip() {
        let reg = registry();
        let meta = reg
            .register_script("alice", CODE, AgentKind::Household, Some("007".into()), None, None)
            .await
            .unwrap();
        assert!(meta.simulation_id.is_none());

        let attached = reg
            .attach_script(&meta.script_id, "alice", "sim-1", None)
            .await
            .unwrap();
        assert_eq!(attached.simulation_id.as_deref(), Some("sim-1"));
        assert_eq!(attached.entity_id, "007");

        let detached = reg.detach_script(&meta.script_id, "alice").await.unwrap();
        assert!(detached.simulation_id.is_none());
        assert_eq!(detached.entity_id, meta.entity_id);
        assert!(reg.list_simulation_scripts("sim-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let reg = ScriptRegistry::new(None, Some(1));
        reg.register_script(
            "alice",
            CODE,
            AgentKind::Household,
            Some("000".into()),
            Some("sim-1".into()),
            None,
        )
        .await
        .unwrap();
        let err = reg
            .register_script(
                "alice",
                CODE,
                AgentKind::Household,
                Some("001".into()),
                Some("sim-1".into()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_update_script_code_bumps_version_keeps_binding() {
        let reg = registry();
        let meta = reg
            .register_script(
                "alice",
                CODE,
                AgentKind::Household,
                Some("000".into()),
                Some("sim-1".into()),
                None,
            )
            .await
            .unwrap();
        let updated = reg
            .update_script_code(
                &meta.script_id,
                Some("alice"),
                "def generate_decisions(context):\n    return {\"households\": {}}\n",
                None,
            )
            .await
            .unwrap();
        assert_ne!(updated.code_version, meta.code_version);
        assert_eq!(updated.simulation_id, meta.simulation_id);
        assert_eq!(updated.entity_id, meta.entity_id);
    }

    #[tokio::test]
    async fn test_invalid_script_rejected() {
        let reg = registry();
        let err = reg
            .register_script("alice", "import os\n", AgentKind::Firm, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidScript(_)));
    }

    #[tokio::test]
    async fn test_concurrent_attach_single_winner() {
        let reg = Arc::new(registry());
        let mut script_ids = Vec::new();
        for i in 0..10 {
            let meta = reg
                .register_script(
                    &format!("user-{i}"),
                    CODE,
                    AgentKind::Household,
                    Some("000".to_string()),
                    None,
                    None,
                )
                .await
                .unwrap();
            script_ids.push((format!("user-{i}"), meta.script_id));
        }

        let mut handles = Vec::new();
        for (user, script_id) in script_ids {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.attach_script(&script_id, &user, "sim-1", None).await
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(RegistryError::ConflictingBinding { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 9);

        let bound = reg.list_simulation_scripts("sim-1").await.unwrap();
        assert_eq!(bound.len(), 1);
    }
}
