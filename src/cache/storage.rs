//! Cache storage traits and SQLite implementation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::types::{RequestIdentity, ResponseSnapshot};
use crate::error::RelayError;
use crate::lifecycle::GenerationState;
use crate::replay::{Mutation, ReplayTask, TaskState};

/// Handle to a named store, obtained from [`CacheStorage::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
  name: String,
}

impl StoreHandle {
  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Registry of named response stores.
///
/// A missing key is `Ok(None)`, never an error.
pub trait CacheStorage: Send + Sync {
  /// Open a store, creating it if absent.
  fn open(&self, name: &str) -> Result<StoreHandle>;

  /// Look up the snapshot stored for an identity.
  fn get(&self, store: &StoreHandle, identity: &RequestIdentity)
    -> Result<Option<ResponseSnapshot>>;

  /// Store a snapshot, replacing any existing entry for the identity.
  fn put(
    &self,
    store: &StoreHandle,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> Result<()>;

  /// Identities held by a store, in insertion order.
  fn keys(&self, store: &StoreHandle) -> Result<Vec<String>>;

  /// Names of every store that currently exists.
  fn list_store_names(&self) -> Result<BTreeSet<String>>;

  /// Remove a store and all of its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;
}

/// Persisted lifecycle state, one row per generation tag.
pub trait GenerationStorage: Send + Sync {
  fn generation_state(&self, generation: &str) -> Result<Option<GenerationState>>;

  fn set_generation_state(&self, generation: &str, state: GenerationState) -> Result<()>;

  /// Mark `generation` active and reset every other generation to new,
  /// atomically. At most one generation is active afterwards.
  fn activate_generation(&self, generation: &str) -> Result<()>;
}

/// Persisted offline mutation queue.
pub trait TaskStorage: Send + Sync {
  /// Append a pending task and return its id.
  fn insert_task(&self, tag: &str, mutation: &Mutation) -> Result<i64>;

  /// Pending tasks for a tag, oldest first.
  fn pending_tasks(&self, tag: &str) -> Result<Vec<ReplayTask>>;

  fn set_task_state(&self, id: i64, state: TaskState) -> Result<()>;

  /// Put a task back to pending and bump its attempt counter.
  fn record_failure(&self, id: i64) -> Result<()>;

  fn remove_task(&self, id: i64) -> Result<()>;

  /// Return tasks stuck in `replaying` (from an interrupted process) to pending.
  fn reset_interrupted(&self) -> Result<usize>;
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as the returned value.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("relaycache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores (static-<generation>, dynamic-<generation>, ...)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, one per (store, request identity)
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    identity_hash TEXT NOT NULL,
    identity TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (store_name, identity_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store_name);

-- Lifecycle state per generation
CREATE TABLE IF NOT EXISTS generations (
    tag TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Offline mutations waiting for a reconnect signal
CREATE TABLE IF NOT EXISTS replay_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_replay_tasks_tag ON replay_tasks(tag, state);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<StoreHandle> {
    let conn = self.conn().map_err(|e| RelayError::StoreOpen {
      name: name.to_string(),
      reason: e.to_string(),
    })?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| RelayError::StoreOpen {
        name: name.to_string(),
        reason: e.to_string(),
      })?;

    Ok(StoreHandle {
      name: name.to_string(),
    })
  }

  fn get(
    &self,
    store: &StoreHandle,
    identity: &RequestIdentity,
  ) -> Result<Option<ResponseSnapshot>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE store_name = ? AND identity_hash = ?",
        params![store.name, identity.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", identity, store.name, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", identity, e))?;
        Ok(Some(ResponseSnapshot {
          status,
          headers,
          body,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    store: &StoreHandle,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> Result<()> {
    let mut conn = self.conn()?;
    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // A store deleted by activation while a write was in flight comes back
    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store.name],
    )
    .map_err(|e| eyre!("Failed to register store {}: {}", store.name, e))?;

    // Upsert keeps the original rowid so `keys` stays in insertion order
    tx.execute(
      "INSERT INTO cache_entries (store_name, identity_hash, identity, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT(store_name, identity_hash) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         cached_at = excluded.cached_at",
      params![
        store.name,
        identity.cache_hash(),
        identity.to_string(),
        snapshot.status,
        headers,
        snapshot.body,
        format_datetime(&snapshot.cached_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", identity, store.name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(store = %store.name, identity = %identity, status = snapshot.status, "Stored response");
    Ok(())
  }

  fn keys(&self, store: &StoreHandle) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT identity FROM cache_entries WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store.name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", store.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key of {}: {}", store.name, e))?;

    Ok(keys)
  }

  fn list_store_names(&self) -> Result<BTreeSet<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

impl GenerationStorage for SqliteStorage {
  fn generation_state(&self, generation: &str) -> Result<Option<GenerationState>> {
    let conn = self.conn()?;

    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM generations WHERE tag = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read state of generation {}: {}", generation, e))?;

    state.map(|s| s.parse()).transpose()
  }

  fn set_generation_state(&self, generation: &str, state: GenerationState) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO generations (tag, state, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![generation, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to save state of generation {}: {}", generation, e))?;

    Ok(())
  }

  fn activate_generation(&self, generation: &str) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let demoted = tx
      .execute(
        "UPDATE generations SET state = ?, updated_at = datetime('now')
         WHERE state != ? AND tag != ?",
        params![
          GenerationState::New.as_str(),
          GenerationState::New.as_str(),
          generation
        ],
      )
      .map_err(|e| eyre!("Failed to demote previous generations: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO generations (tag, state, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![generation, GenerationState::Active.as_str()],
    )
    .map_err(|e| eyre!("Failed to activate generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(%generation, demoted, "Generation marked active");
    Ok(())
  }
}

impl TaskStorage for SqliteStorage {
  fn insert_task(&self, tag: &str, mutation: &Mutation) -> Result<i64> {
    let conn = self.conn()?;
    let payload =
      serde_json::to_string(mutation).map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;

    conn
      .execute(
        "INSERT INTO replay_tasks (tag, payload, state, attempts, enqueued_at)
         VALUES (?, ?, ?, 0, ?)",
        params![
          tag,
          payload,
          TaskState::Pending.as_str(),
          format_datetime(&Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue task: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending_tasks(&self, tag: &str) -> Result<Vec<ReplayTask>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, payload, attempts, enqueued_at FROM replay_tasks
         WHERE tag = ? AND state = ?
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag, TaskState::Pending.as_str()], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u32>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, attempts, enqueued_at)| {
        let mutation: Mutation = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to deserialize task {}: {}", id, e))?;
        Ok(ReplayTask {
          id,
          tag: tag.to_string(),
          mutation,
          state: TaskState::Pending,
          attempts,
          enqueued_at: parse_datetime(&enqueued_at)?,
        })
      })
      .collect()
  }

  fn set_task_state(&self, id: i64, state: TaskState) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE replay_tasks SET state = ? WHERE id = ?",
        params![state.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;

    Ok(())
  }

  fn record_failure(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE replay_tasks SET state = ?, attempts = attempts + 1 WHERE id = ?",
        params![TaskState::Pending.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;

    Ok(())
  }

  fn remove_task(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM replay_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove task {}: {}", id, e))?;

    Ok(())
  }

  fn reset_interrupted(&self) -> Result<usize> {
    let reset = self
      .conn()?
      .execute(
        "UPDATE replay_tasks SET state = ? WHERE state = ?",
        params![TaskState::Pending.as_str(), TaskState::Replaying.as_str()],
      )
      .map_err(|e| eyre!("Failed to reset interrupted tasks: {}", e))?;

    Ok(reset)
  }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp written by [`format_datetime`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn identity(path: &str) -> RequestIdentity {
    RequestIdentity::get(&Url::parse("https://clinic.example").unwrap().join(path).unwrap())
  }

  fn snapshot(status: u16, body: &str) -> ResponseSnapshot {
    ResponseSnapshot::new(
      status,
      vec![("content-type".to_string(), "text/plain".to_string())],
      body,
    )
  }

  #[test]
  fn test_open_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("dynamic-v1").unwrap();
    storage.open("dynamic-v1").unwrap();

    let names = storage.list_store_names().unwrap();
    assert_eq!(names.len(), 1);
    assert!(names.contains("dynamic-v1"));
  }

  #[test]
  fn test_get_missing_is_none() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let store = storage.open("dynamic-v1").unwrap();
    assert!(storage.get(&store, &identity("/api/patients")).unwrap().is_none());
  }

  #[test]
  fn test_put_then_get_returns_snapshot() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let store = storage.open("dynamic-v1").unwrap();
    let snap = snapshot(200, "[]");

    storage.put(&store, &identity("/api/patients"), &snap).unwrap();

    let stored = storage.get(&store, &identity("/api/patients")).unwrap();
    assert_eq!(stored, Some(snap));
  }

  #[test]
  fn test_put_overwrites_and_keeps_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let store = storage.open("dynamic-v1").unwrap();

    storage.put(&store, &identity("/a"), &snapshot(200, "a1")).unwrap();
    storage.put(&store, &identity("/b"), &snapshot(200, "b1")).unwrap();
    storage.put(&store, &identity("/a"), &snapshot(200, "a2")).unwrap();

    let stored = storage.get(&store, &identity("/a")).unwrap().unwrap();
    assert_eq!(stored.body_text(), "a2");

    let keys = storage.keys(&store).unwrap();
    assert_eq!(
      keys,
      vec![
        "GET https://clinic.example/a".to_string(),
        "GET https://clinic.example/b".to_string()
      ]
    );
  }

  #[test]
  fn test_stores_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let one = storage.open("static-v1").unwrap();
    let two = storage.open("dynamic-v1").unwrap();

    storage.put(&one, &identity("/app.css"), &snapshot(200, "css")).unwrap();

    assert!(storage.get(&two, &identity("/app.css")).unwrap().is_none());
  }

  #[test]
  fn test_delete_removes_store_and_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let store = storage.open("dynamic-v1").unwrap();
    storage.put(&store, &identity("/a"), &snapshot(200, "a")).unwrap();

    assert!(storage.delete("dynamic-v1").unwrap());
    assert!(!storage.list_store_names().unwrap().contains("dynamic-v1"));

    // Reopening yields an empty store
    let store = storage.open("dynamic-v1").unwrap();
    assert!(storage.get(&store, &identity("/a")).unwrap().is_none());
  }

  #[test]
  fn test_delete_missing_is_noop() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(!storage.delete("nope").unwrap());
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      let store = storage.open("static-v1").unwrap();
      storage.put(&store, &identity("/index.html"), &snapshot(200, "<html>")).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let store = storage.open("static-v1").unwrap();
    let stored = storage.get(&store, &identity("/index.html")).unwrap().unwrap();
    assert_eq!(stored.body_text(), "<html>");
  }

  #[test]
  fn test_generation_state_roundtrip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.generation_state("v1").unwrap(), None);

    storage.set_generation_state("v1", GenerationState::Installed).unwrap();
    storage.set_generation_state("v1", GenerationState::Active).unwrap();

    assert_eq!(
      storage.generation_state("v1").unwrap(),
      Some(GenerationState::Active)
    );
  }

  #[test]
  fn test_activate_generation_resets_others() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.activate_generation("v1").unwrap();
    storage.set_generation_state("v2", GenerationState::Installed).unwrap();

    storage.activate_generation("v2").unwrap();

    assert_eq!(
      storage.generation_state("v1").unwrap(),
      Some(GenerationState::New)
    );
    assert_eq!(
      storage.generation_state("v2").unwrap(),
      Some(GenerationState::Active)
    );
  }

  #[test]
  fn test_tasks_are_listed_per_tag_in_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = storage.insert_task("sync", &Mutation::post("/api/a", None)).unwrap();
    storage.insert_task("other", &Mutation::post("/api/x", None)).unwrap();
    let second = storage.insert_task("sync", &Mutation::post("/api/b", None)).unwrap();

    let tasks = storage.pending_tasks("sync").unwrap();
    let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(tasks[1].mutation.path, "/api/b");
  }

  #[test]
  fn test_replaying_tasks_are_hidden_until_reset() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let id = storage.insert_task("sync", &Mutation::post("/api/a", None)).unwrap();

    storage.set_task_state(id, TaskState::Replaying).unwrap();
    assert!(storage.pending_tasks("sync").unwrap().is_empty());

    assert_eq!(storage.reset_interrupted().unwrap(), 1);
    assert_eq!(storage.pending_tasks("sync").unwrap().len(), 1);
  }

  #[test]
  fn test_record_failure_bumps_attempts() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let id = storage.insert_task("sync", &Mutation::post("/api/a", None)).unwrap();

    storage.set_task_state(id, TaskState::Replaying).unwrap();
    storage.record_failure(id).unwrap();

    let tasks = storage.pending_tasks("sync").unwrap();
    assert_eq!(tasks[0].attempts, 1);
  }
}
