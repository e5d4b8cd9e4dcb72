//! Two-tier state store
//!
//! Authoritative persistence for world state, tick logs and participant
//! sets. The cache tier holds the working copy every reader sees; the
//! durable tier receives write-through copies with bounded-backoff retry.
//! Exhausting the retry budget surfaces `StoreError::Persistence`, which
//! the orchestrator treats as fatal for the simulation.
//!
//! Consistency: write-through with read-your-writes within a single
//! orchestrator. `apply_updates` is all-or-nothing against the cache:
//! the batch is applied to a cloned document that is only swapped in when
//! every command succeeded.

pub mod cache;
pub mod durable;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{StoreConfig, WorldConfig};
use crate::models::{apply_command, StateUpdateCommand, TickLogEntry, UpdateError, WorldState};

pub use cache::{CacheTier, MemoryCache};
pub use durable::{DurableTier, SqliteStore, TickLogQuery};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("simulation '{0}' not found")]
    NotFound(String),

    #[error("cache tier error: {0}")]
    Cache(String),

    #[error("durable tier error: {0}")]
    Durable(String),

    #[error("durable write for '{0}' failed after retry budget")]
    Persistence(String),

    #[error("world serialization failed: {0}")]
    Serialization(String),

    #[error("update rejected: {0}")]
    InvalidUpdate(#[from] UpdateError),
}

/// Hash of the configuration a world was synthesized from, stored next to
/// the snapshot so a restore against a different config is detectable.
pub fn config_hash(config: &WorldConfig) -> String {
    let encoded = serde_json::to_string(config).unwrap_or_default();
    let digest = Sha256::digest(encoded.as_bytes());
    format!("{digest:x}")
}

/// Facade over the cache and durable tiers.
pub struct StateStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableTier>,
    settings: StoreConfig,
}

impl StateStore {
    pub fn new(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableTier>,
        settings: StoreConfig,
    ) -> Self {
        Self {
            cache,
            durable,
            settings,
        }
    }

    /// Idempotent create: returns the existing world if present in either
    /// tier, otherwise synthesizes the initial state from `config` and
    /// persists it to both.
    pub async fn ensure_simulation(
        &self,
        simulation_id: &str,
        config: &WorldConfig,
    ) -> Result<WorldState, StoreError> {
        if let Some(doc) = self.cache.get_world(simulation_id).await? {
            return decode_world(doc);
        }
        if let Some(doc) = self.durable.load_snapshot(simulation_id).await? {
            debug!(simulation_id, "cache miss; backfilling world from durable tier");
            self.cache.put_world(simulation_id, doc.clone()).await?;
            return decode_world(doc);
        }

        let world = WorldState::initial(simulation_id, config);
        let doc = encode_world(&world)?;
        self.cache.put_world(simulation_id, doc.clone()).await?;
        self.write_snapshot_with_retry(simulation_id, world.tick, &doc, config)
            .await?;
        Ok(world)
    }

    /// Read-through lookup. Fails with `NotFound` when the simulation is
    /// absent from both tiers.
    pub async fn get_world_state(&self, simulation_id: &str) -> Result<WorldState, StoreError> {
        if let Some(doc) = self.cache.get_world(simulation_id).await? {
            return decode_world(doc);
        }
        if let Some(doc) = self.durable.load_snapshot(simulation_id).await? {
            self.cache.put_world(simulation_id, doc.clone()).await?;
            return decode_world(doc);
        }
        Err(StoreError::NotFound(simulation_id.to_string()))
    }

    /// Apply a command batch atomically against the cache, then propagate
    /// the new document to the durable tier with bounded retry.
    pub async fn apply_updates(
        &self,
        simulation_id: &str,
        commands: &[StateUpdateCommand],
        config: &WorldConfig,
    ) -> Result<WorldState, StoreError> {
        let doc = self
            .cache
            .get_world(simulation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(simulation_id.to_string()))?;

        // All-or-nothing: mutate a clone, swap in only on full success.
        let mut next = doc.clone();
        for command in commands {
            apply_command(&mut next, command)?;
        }
        let world = decode_world(next.clone())?;
        self.cache.put_world(simulation_id, next.clone()).await?;

        self.write_snapshot_with_retry(simulation_id, world.tick, &next, config)
            .await?;
        Ok(world)
    }

    /// Append tick logs to the cache ring and the durable table.
    pub async fn record_tick(
        &self,
        simulation_id: &str,
        entries: &[TickLogEntry],
    ) -> Result<(), StoreError> {
        self.cache
            .append_logs(simulation_id, entries, self.settings.log_ring_capacity)
            .await?;

        let budget = self.settings.durable_retry_budget.max(1);
        let mut delay = Duration::from_millis(self.settings.durable_retry_base_ms);
        let mut last_error = String::new();
        for attempt in 1..=budget {
            match self.durable.append_tick_logs(entries).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        simulation_id,
                        attempt,
                        budget,
                        error = %last_error,
                        "durable log append failed"
                    );
                    if attempt < budget {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(StoreError::Persistence(format!(
            "{simulation_id}: {last_error}"
        )))
    }

    /// Recent (cached) tick logs.
    pub async fn recent_logs(&self, simulation_id: &str) -> Result<Vec<TickLogEntry>, StoreError> {
        self.cache.recent_logs(simulation_id).await
    }

    /// Durable tick-log query.
    pub async fn list_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> Result<Vec<TickLogEntry>, StoreError> {
        self.durable.query_tick_logs(simulation_id, query).await
    }

    /// Drop world state from both tiers. Script bindings are untouched;
    /// durable tick logs are retained (append-only history).
    pub async fn reset_simulation(&self, simulation_id: &str) -> Result<(), StoreError> {
        self.cache.delete_world(simulation_id).await?;
        self.cache.clear_logs(simulation_id).await?;
        self.durable.delete_snapshot(simulation_id).await
    }

    /// Drop world state and release the participant set.
    pub async fn delete_simulation(&self, simulation_id: &str) -> Result<(), StoreError> {
        self.reset_simulation(simulation_id).await?;
        self.cache.clear_participants(simulation_id).await
    }

    pub async fn register_participant(
        &self,
        simulation_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        self.cache.add_participant(simulation_id, user_id).await
    }

    pub async fn list_participants(&self, simulation_id: &str) -> Result<Vec<String>, StoreError> {
        self.cache.list_participants(simulation_id).await
    }

    /// Bounded exponential backoff around the durable snapshot write.
    /// The cache has already been updated when this runs; an exhausted
    /// budget escalates to `Persistence` and the orchestrator freezes
    /// the simulation.
    async fn write_snapshot_with_retry(
        &self,
        simulation_id: &str,
        tick: u64,
        doc: &Value,
        config: &WorldConfig,
    ) -> Result<(), StoreError> {
        let hash = config_hash(config);
        let budget = self.settings.durable_retry_budget.max(1);
        let mut delay = Duration::from_millis(self.settings.durable_retry_base_ms);
        let mut last_error = String::new();
        for attempt in 1..=budget {
            match self
                .durable
                .save_snapshot(simulation_id, tick, doc, &hash)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        simulation_id,
                        attempt,
                        budget,
                        error = %last_error,
                        "durable snapshot write failed"
                    );
                    if attempt < budget {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(StoreError::Persistence(format!(
            "{simulation_id}: {last_error}"
        )))
    }
}

fn encode_world(world: &WorldState) -> Result<Value, StoreError> {
    serde_json::to_value(world).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_world(doc: Value) -> Result<WorldState, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Serialization(e.to_string()))
}
