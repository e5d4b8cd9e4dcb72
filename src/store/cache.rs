//! Cache tier
//!
//! Low-latency keyed store holding the authoritative working copy of each
//! world, a bounded ring of recent tick logs and the participant set. The
//! keyspace follows the `sim:{id}:world` / `sim:{id}:logs` /
//! `sim:{id}:participants` layout so an external key-value server can be
//! slotted in behind the same trait.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::models::TickLogEntry;

use super::StoreError;

/// Key-value cache operations the state store composes.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get_world(&self, simulation_id: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the world document. The caller guarantees the document is
    /// the result of a completed tick, a reset, or initial synthesis.
    async fn put_world(&self, simulation_id: &str, world: Value) -> Result<(), StoreError>;

    async fn delete_world(&self, simulation_id: &str) -> Result<(), StoreError>;

    /// Append entries to the bounded recent-log ring.
    async fn append_logs(
        &self,
        simulation_id: &str,
        entries: &[TickLogEntry],
        capacity: usize,
    ) -> Result<(), StoreError>;

    async fn recent_logs(&self, simulation_id: &str) -> Result<Vec<TickLogEntry>, StoreError>;

    async fn clear_logs(&self, simulation_id: &str) -> Result<(), StoreError>;

    async fn add_participant(&self, simulation_id: &str, user_id: &str)
        -> Result<(), StoreError>;

    async fn list_participants(&self, simulation_id: &str) -> Result<Vec<String>, StoreError>;

    async fn clear_participants(&self, simulation_id: &str) -> Result<(), StoreError>;
}

fn world_key(simulation_id: &str) -> String {
    format!("sim:{simulation_id}:world")
}

fn logs_key(simulation_id: &str) -> String {
    format!("sim:{simulation_id}:logs")
}

fn participants_key(simulation_id: &str) -> String {
    format!("sim:{simulation_id}:participants")
}

/// In-process cache tier.
///
/// A single mutex over three keyed maps; batch apply happens in the
/// facade (clone, mutate, swap) so readers never observe a partial tick.
#[derive(Default)]
pub struct MemoryCache {
    worlds: Mutex<HashMap<String, Value>>,
    logs: Mutex<HashMap<String, VecDeque<TickLogEntry>>>,
    participants: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get_world(&self, simulation_id: &str) -> Result<Option<Value>, StoreError> {
        let worlds = self.worlds.lock().await;
        Ok(worlds.get(&world_key(simulation_id)).cloned())
    }

    async fn put_world(&self, simulation_id: &str, world: Value) -> Result<(), StoreError> {
        let mut worlds = self.worlds.lock().await;
        worlds.insert(world_key(simulation_id), world);
        Ok(())
    }

    async fn delete_world(&self, simulation_id: &str) -> Result<(), StoreError> {
        let mut worlds = self.worlds.lock().await;
        worlds.remove(&world_key(simulation_id));
        Ok(())
    }

    async fn append_logs(
        &self,
        simulation_id: &str,
        entries: &[TickLogEntry],
        capacity: usize,
    ) -> Result<(), StoreError> {
        let mut logs = self.logs.lock().await;
        let ring = logs.entry(logs_key(simulation_id)).or_default();
        for entry in entries {
            if ring.len() == capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        Ok(())
    }

    async fn recent_logs(&self, simulation_id: &str) -> Result<Vec<TickLogEntry>, StoreError> {
        let logs = self.logs.lock().await;
        Ok(logs
            .get(&logs_key(simulation_id))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_logs(&self, simulation_id: &str) -> Result<(), StoreError> {
        let mut logs = self.logs.lock().await;
        logs.remove(&logs_key(simulation_id));
        Ok(())
    }

    async fn add_participant(
        &self,
        simulation_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut participants = self.participants.lock().await;
        participants
            .entry(participants_key(simulation_id))
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn list_participants(&self, simulation_id: &str) -> Result<Vec<String>, StoreError> {
        let participants = self.participants.lock().await;
        Ok(participants
            .get(&participants_key(simulation_id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_participants(&self, simulation_id: &str) -> Result<(), StoreError> {
        let mut participants = self.participants.lock().await;
        participants.remove(&participants_key(simulation_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_ring_is_bounded() {
        let cache = MemoryCache::new();
        for tick in 0..10u64 {
            let entry = TickLogEntry::new("sim-1", tick, 0, "m");
            cache.append_logs("sim-1", &[entry], 4).await.unwrap();
        }
        let logs = cache.recent_logs("sim-1").await.unwrap();
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[0].tick, 6);
        assert_eq!(logs[3].tick, 9);
    }

    #[tokio::test]
    async fn test_participants_are_a_set() {
        let cache = MemoryCache::new();
        cache.add_participant("sim-1", "alice").await.unwrap();
        cache.add_participant("sim-1", "alice").await.unwrap();
        cache.add_participant("sim-1", "bob").await.unwrap();
        let users = cache.list_participants("sim-1").await.unwrap();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }
}
