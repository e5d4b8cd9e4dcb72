//! Durable tier
//!
//! Embedded relational store behind the `DurableTier` and `ScriptStore`
//! traits. Tables: `scripts`, `tick_logs`, `simulation_limits`,
//! `world_snapshots`. Connections are synchronous, so every call hops
//! onto the blocking pool.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::models::TickLogEntry;
use crate::registry::{ScriptMetadata, ScriptStore, StoredScript};

use super::StoreError;

/// Filters for the tick-log query surface.
#[derive(Debug, Clone, Default)]
pub struct TickLogQuery {
    pub tick_range: Option<(u64, u64)>,
    pub day_range: Option<(u64, u64)>,
    /// Substring match on the message column.
    pub message_filter: Option<String>,
    pub limit: u64,
    pub offset: u64,
}

/// Relational persistence operations the state store composes.
#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn save_snapshot(
        &self,
        simulation_id: &str,
        tick: u64,
        world: &Value,
        config_hash: &str,
    ) -> Result<(), StoreError>;

    async fn load_snapshot(&self, simulation_id: &str) -> Result<Option<Value>, StoreError>;

    async fn delete_snapshot(&self, simulation_id: &str) -> Result<(), StoreError>;

    async fn append_tick_logs(&self, entries: &[TickLogEntry]) -> Result<(), StoreError>;

    async fn query_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> Result<Vec<TickLogEntry>, StoreError>;
}

/// SQLite-backed implementation of both durable traits.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scripts (
                 script_id TEXT PRIMARY KEY,
                 simulation_id TEXT,
                 user_id TEXT NOT NULL,
                 agent_kind TEXT NOT NULL,
                 entity_id TEXT,
                 description TEXT,
                 code TEXT NOT NULL,
                 code_version TEXT NOT NULL,
                 last_failure_tick INTEGER,
                 last_failure_reason TEXT,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE UNIQUE INDEX IF NOT EXISTS idx_scripts_binding
                 ON scripts(simulation_id, agent_kind, entity_id)
                 WHERE simulation_id IS NOT NULL;
             CREATE TABLE IF NOT EXISTS tick_logs (
                 simulation_id TEXT NOT NULL,
                 tick INTEGER NOT NULL,
                 day INTEGER NOT NULL,
                 message TEXT NOT NULL,
                 context TEXT NOT NULL,
                 recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_tick_logs_sim_tick
                 ON tick_logs(simulation_id, tick);
             CREATE TABLE IF NOT EXISTS simulation_limits (
                 simulation_id TEXT PRIMARY KEY,
                 script_limit INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS world_snapshots (
                 simulation_id TEXT PRIMARY KEY,
                 tick INTEGER NOT NULL,
                 state TEXT NOT NULL,
                 config_hash TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite mutex poisoned");
            f(&guard).map_err(sqlite_err)
        })
        .await
        .map_err(|e| StoreError::Durable(format!("blocking task failed: {e}")))?
    }
}

fn sqlite_err(err: rusqlite::Error) -> StoreError {
    StoreError::Durable(err.to_string())
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl DurableTier for SqliteStore {
    async fn save_snapshot(
        &self,
        simulation_id: &str,
        tick: u64,
        world: &Value,
        config_hash: &str,
    ) -> Result<(), StoreError> {
        let simulation_id = simulation_id.to_string();
        let state = world.to_string();
        let config_hash = config_hash.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO world_snapshots (simulation_id, tick, state, config_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(simulation_id) DO UPDATE SET
                     tick = excluded.tick,
                     state = excluded.state,
                     config_hash = excluded.config_hash,
                     updated_at = excluded.updated_at",
                params![simulation_id, tick as i64, state, config_hash, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_snapshot(&self, simulation_id: &str) -> Result<Option<Value>, StoreError> {
        let simulation_id = simulation_id.to_string();
        let raw: Option<String> = self
            .blocking(move |conn| {
                conn.query_row(
                    "SELECT state FROM world_snapshots WHERE simulation_id = ?1",
                    params![simulation_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::Durable(format!("corrupt snapshot: {e}"))),
        }
    }

    async fn delete_snapshot(&self, simulation_id: &str) -> Result<(), StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM world_snapshots WHERE simulation_id = ?1",
                params![simulation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_tick_logs(&self, entries: &[TickLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, i64, i64, String, String)> = entries
            .iter()
            .map(|e| {
                (
                    e.simulation_id.clone(),
                    e.tick as i64,
                    e.day as i64,
                    e.message.clone(),
                    serde_json::to_string(&e.context).unwrap_or_else(|_| "{}".to_string()),
                )
            })
            .collect();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO tick_logs (simulation_id, tick, day, message, context)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (sim, tick, day, message, context) in &rows {
                stmt.execute(params![sim, tick, day, message, context])?;
            }
            Ok(())
        })
        .await
    }

    async fn query_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> Result<Vec<TickLogEntry>, StoreError> {
        let simulation_id = simulation_id.to_string();
        let query = query.clone();
        self.blocking(move |conn| {
            let mut sql = String::from(
                "SELECT simulation_id, tick, day, message, context FROM tick_logs
                 WHERE simulation_id = ?1",
            );
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(simulation_id.clone())];
            if let Some((lo, hi)) = query.tick_range {
                sql.push_str(&format!(
                    " AND tick >= ?{} AND tick <= ?{}",
                    args.len() + 1,
                    args.len() + 2
                ));
                args.push(Box::new(lo as i64));
                args.push(Box::new(hi as i64));
            }
            if let Some((lo, hi)) = query.day_range {
                sql.push_str(&format!(
                    " AND day >= ?{} AND day <= ?{}",
                    args.len() + 1,
                    args.len() + 2
                ));
                args.push(Box::new(lo as i64));
                args.push(Box::new(hi as i64));
            }
            if let Some(filter) = &query.message_filter {
                sql.push_str(&format!(" AND message LIKE ?{}", args.len() + 1));
                args.push(Box::new(format!("%{filter}%")));
            }
            let limit = if query.limit == 0 { 100 } else { query.limit };
            sql.push_str(&format!(
                " ORDER BY rowid LIMIT {limit} OFFSET {}",
                query.offset
            ));

            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), |row| {
                let context_raw: String = row.get(4)?;
                Ok(TickLogEntry {
                    simulation_id: row.get(0)?,
                    tick: row.get::<_, i64>(1)? as u64,
                    day: row.get::<_, i64>(2)? as u64,
                    message: row.get(3)?,
                    context: serde_json::from_str(&context_raw).unwrap_or_default(),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }
}

fn metadata_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredScript> {
    Ok(StoredScript {
        metadata: ScriptMetadata {
            script_id: row.get(0)?,
            simulation_id: row.get(1)?,
            user_id: row.get(2)?,
            agent_kind: serde_json::from_value(Value::String(row.get::<_, String>(3)?))
                .unwrap_or(crate::models::AgentKind::Household),
            entity_id: row.get(4)?,
            description: row.get(5)?,
            code_version: row.get(6)?,
            last_failure_tick: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
            last_failure_reason: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
        code: row.get(11)?,
    })
}

const SCRIPT_COLUMNS: &str = "script_id, simulation_id, user_id, agent_kind, entity_id, \
     description, code_version, last_failure_tick, last_failure_reason, created_at, \
     updated_at, code";

#[async_trait]
impl ScriptStore for SqliteStore {
    async fn save_script(&self, metadata: &ScriptMetadata, code: &str) -> Result<(), StoreError> {
        let m = metadata.clone();
        let code = code.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO scripts (script_id, simulation_id, user_id, agent_kind, entity_id,
                                      description, code, code_version, last_failure_tick,
                                      last_failure_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(script_id) DO UPDATE SET
                     simulation_id = excluded.simulation_id,
                     entity_id = excluded.entity_id,
                     description = excluded.description,
                     code = excluded.code,
                     code_version = excluded.code_version,
                     last_failure_tick = excluded.last_failure_tick,
                     last_failure_reason = excluded.last_failure_reason,
                     updated_at = excluded.updated_at",
                params![
                    m.script_id,
                    m.simulation_id,
                    m.user_id,
                    m.agent_kind.as_str(),
                    m.entity_id,
                    m.description,
                    code,
                    m.code_version,
                    m.last_failure_tick.map(|t| t as i64),
                    m.last_failure_reason,
                    m.created_at,
                    m.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch_simulation_scripts(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<StoredScript>, StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCRIPT_COLUMNS} FROM scripts WHERE simulation_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![simulation_id], metadata_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn fetch_user_scripts(&self, user_id: &str) -> Result<Vec<StoredScript>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCRIPT_COLUMNS} FROM scripts WHERE user_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![user_id], metadata_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn delete_script(&self, script_id: &str) -> Result<bool, StoreError> {
        let script_id = script_id.to_string();
        self.blocking(move |conn| {
            let n = conn.execute(
                "DELETE FROM scripts WHERE script_id = ?1",
                params![script_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn detach_simulation(&self, simulation_id: &str) -> Result<Vec<String>, StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT script_id FROM scripts WHERE simulation_id = ?1")?;
            let ids: Vec<String> = stmt
                .query_map(params![simulation_id.clone()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            conn.execute(
                "UPDATE scripts SET simulation_id = NULL, updated_at = ?2
                 WHERE simulation_id = ?1",
                params![simulation_id, now_epoch()],
            )?;
            Ok(ids)
        })
        .await
    }

    async fn set_script_limit(&self, simulation_id: &str, limit: u64) -> Result<(), StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO simulation_limits (simulation_id, script_limit, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(simulation_id) DO UPDATE SET
                     script_limit = excluded.script_limit,
                     updated_at = excluded.updated_at",
                params![simulation_id, limit as i64, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_script_limit(&self, simulation_id: &str) -> Result<Option<u64>, StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT script_limit FROM simulation_limits WHERE simulation_id = ?1",
                params![simulation_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.map(|n| n as u64))
        })
        .await
    }

    async fn delete_script_limit(&self, simulation_id: &str) -> Result<(), StoreError> {
        let simulation_id = simulation_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM simulation_limits WHERE simulation_id = ?1",
                params![simulation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_failure_status(
        &self,
        script_id: &str,
        failure_tick: Option<u64>,
        failure_reason: Option<String>,
    ) -> Result<(), StoreError> {
        let script_id = script_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE scripts SET last_failure_tick = ?2, last_failure_reason = ?3
                 WHERE script_id = ?1",
                params![script_id, failure_tick.map(|t| t as i64), failure_reason],
            )?;
            Ok(())
        })
        .await
    }
}
