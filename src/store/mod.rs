//! Durable store: the single owner of everything the engine persists.
//!
//! Backed by one SQLite database. Holds the named cache partitions, cached
//! HTTP responses, domain entity snapshots, the pending-mutation queue and
//! push subscription records. Every operation commits before it returns, so
//! the hosting process can be terminated between any two calls and a fresh
//! worker resumes from the store alone.

pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Partition name of the pending-mutation queue.
pub const MUTATIONS_PARTITION: &str = "mutations:pending";

/// Partition name of the push subscription records.
pub const SUBSCRIPTIONS_PARTITION: &str = "push:subscriptions";

/// A named cache bucket. Versioned buckets embed the version tag in their
/// name, which is what the lifecycle GC keys on.
#[derive(Debug, Clone)]
pub struct CachePartition {
  pub name: String,
  pub version: String,
  pub max_age: chrono::Duration,
  pub created_at: DateTime<Utc>,
}

/// A stored response for one request key.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  /// Set by the cache manager at write time, never by the origin.
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Age of the entry relative to now.
  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.cached_at
  }

  /// Whether the entry is within the given max-age policy. Staleness is
  /// advisory: stale entries remain servable as a last resort.
  pub fn is_fresh(&self, max_age: chrono::Duration) -> bool {
    self.age() <= max_age
  }
}

/// A durable record of a user action taken while offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMutation {
  /// Client-generated identifier, doubling as the server-side dedup key.
  pub id: Uuid,
  /// Action kind, e.g. "dose-logged" or "entry-added".
  pub action: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub rejected: bool,
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl PendingMutation {
  /// New unsynced mutation with a fresh client-generated id.
  pub fn new(action: impl Into<String>, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      action: action.into(),
      payload,
      created_at: Utc::now(),
      synced: false,
      rejected: false,
      attempts: 0,
      last_error: None,
    }
  }
}

/// Endpoint and key material for one push registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushSubscriptionRecord {
  pub endpoint: String,
  pub p256dh: String,
  pub auth: String,
  pub created_at: DateTime<Utc>,
}

/// Queue counters for the foreground sync indicator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
  pub pending: usize,
  pub rejected: usize,
  pub oldest_pending: Option<DateTime<Utc>>,
}

/// SQLite-backed durable store.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        EngineError::StorageUnavailable(format!("failed to create data directory: {e}"))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      EngineError::StorageUnavailable(format!("failed to open store at {}: {e}", path.display()))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store for tests and scratch use.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Default database path under the platform data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        EngineError::StorageUnavailable("could not determine data directory".to_string())
      })?;

    Ok(data_dir.join("medsync").join("engine.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute_batch(schema::SCHEMA).map_err(|e| {
      EngineError::StorageUnavailable(format!("failed to run migrations: {e}"))
    })?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::StorageUnavailable(format!("lock poisoned: {e}")))
  }

  // ============================================================================
  // Cache partitions
  // ============================================================================

  /// Register a partition if absent. Re-registering an existing name leaves
  /// the original row untouched.
  pub fn ensure_partition(&self, name: &str, version: &str, max_age: chrono::Duration) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO partitions (name, version, max_age_secs, created_at)
       VALUES (?, ?, ?, ?)",
      params![name, version, max_age.num_seconds(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  pub fn partition(&self, name: &str) -> Result<Option<CachePartition>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT name, version, max_age_secs, created_at FROM partitions WHERE name = ?",
        params![name],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
          ))
        },
      )
      .optional()?;

    row
      .map(|(name, version, max_age_secs, created_at)| {
        Ok(CachePartition {
          name,
          version,
          max_age: chrono::Duration::seconds(max_age_secs),
          created_at: parse_datetime(&created_at)?,
        })
      })
      .transpose()
  }

  /// Every stored partition name: the versioned HTTP cache buckets plus the
  /// unversioned entity, queue and subscription partitions.
  pub fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut names = Vec::new();

    let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in rows {
      names.push(name?);
    }

    let mut stmt = conn.prepare("SELECT DISTINCT entity_type FROM entities ORDER BY entity_type")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for entity_type in rows {
      names.push(format!("entities:{}", entity_type?));
    }

    names.push(MUTATIONS_PARTITION.to_string());
    names.push(SUBSCRIPTIONS_PARTITION.to_string());

    Ok(names)
  }

  /// Delete one partition and everything stored under it. Unknown names are
  /// a no-op.
  pub fn delete_partition(&self, name: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    if let Some(entity_type) = name.strip_prefix("entities:") {
      tx.execute("DELETE FROM entities WHERE entity_type = ?", params![entity_type])?;
    } else {
      tx.execute("DELETE FROM http_cache WHERE partition = ?", params![name])?;
      tx.execute("DELETE FROM partitions WHERE name = ?", params![name])?;
    }

    tx.commit()?;
    Ok(())
  }

  // ============================================================================
  // Cached HTTP responses
  // ============================================================================

  pub fn put_entry(&self, partition: &str, request_key: &str, url: &str, entry: &CachedEntry) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO http_cache (partition, request_key, url, status, content_type, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        request_key,
        url,
        entry.status,
        entry.content_type,
        entry.body,
        entry.cached_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  pub fn get_entry(&self, partition: &str, request_key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, content_type, body, cached_at FROM http_cache
         WHERE partition = ? AND request_key = ?",
        params![partition, request_key],
        |row| {
          Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, String>(3)?,
          ))
        },
      )
      .optional()?;

    row
      .map(|(status, content_type, body, cached_at)| {
        Ok(CachedEntry {
          status,
          content_type,
          body,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .transpose()
  }

  pub fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM http_cache WHERE partition = ?",
      params![partition],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Newest cached_at per registered partition, for the status surface.
  pub fn partition_ages(&self) -> Result<Vec<(String, Option<DateTime<Utc>>)>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT p.name, MAX(h.cached_at) FROM partitions p
       LEFT JOIN http_cache h ON h.partition = p.name
       GROUP BY p.name ORDER BY p.name",
    )?;
    let rows = stmt.query_map([], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut ages = Vec::new();
    for row in rows {
      let (name, newest) = row?;
      let newest = newest.map(|s| parse_datetime(&s)).transpose()?;
      ages.push((name, newest));
    }
    Ok(ages)
  }

  // ============================================================================
  // Entity snapshots
  // ============================================================================

  /// Wholesale replace of one entity cache. Atomic: readers observe either
  /// the old set or the new set, never a mix.
  pub fn replace_entities(&self, entity_type: &str, entities: &[(String, Value)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM entities WHERE entity_type = ?", params![entity_type])?;
    let now = Utc::now().to_rfc3339();
    {
      let mut stmt = tx.prepare(
        "INSERT INTO entities (entity_type, entity_id, data, cached_at) VALUES (?, ?, ?, ?)",
      )?;
      for (entity_id, data) in entities {
        stmt.execute(params![entity_type, entity_id, serde_json::to_vec(data)?, now])?;
      }
    }

    tx.commit()?;
    Ok(())
  }

  pub fn get_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
    let conn = self.lock()?;
    let data = conn
      .query_row(
        "SELECT data FROM entities WHERE entity_type = ? AND entity_id = ?",
        params![entity_type, entity_id],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional()?;

    data.map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into)).transpose()
  }

  pub fn list_entities(&self, entity_type: &str) -> Result<Vec<Value>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT data FROM entities WHERE entity_type = ? ORDER BY entity_id",
    )?;
    let rows = stmt.query_map(params![entity_type], |row| row.get::<_, Vec<u8>>(0))?;

    let mut entities = Vec::new();
    for row in rows {
      entities.push(serde_json::from_slice(&row?)?);
    }
    Ok(entities)
  }

  // ============================================================================
  // Pending-mutation queue
  // ============================================================================

  /// Append a mutation. Idempotent on the client-generated id: re-enqueueing
  /// an id that is already present leaves the original record untouched.
  pub fn enqueue(&self, mutation: &PendingMutation) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO mutations (id, action, payload, created_at, synced, rejected, attempts, last_error)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        mutation.id.to_string(),
        mutation.action,
        serde_json::to_vec(&mutation.payload)?,
        mutation.created_at.to_rfc3339(),
        mutation.synced,
        mutation.rejected,
        mutation.attempts,
        mutation.last_error
      ],
    )?;
    Ok(())
  }

  /// Snapshot of unsynced, non-rejected records in insertion order.
  pub fn list_unsynced(&self) -> Result<Vec<PendingMutation>> {
    self.list_mutations("WHERE synced = 0 AND rejected = 0")
  }

  /// Terminally rejected records, kept for inspection.
  pub fn list_rejected(&self) -> Result<Vec<PendingMutation>> {
    self.list_mutations("WHERE rejected = 1")
  }

  fn list_mutations(&self, filter: &str) -> Result<Vec<PendingMutation>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT id, action, payload, created_at, synced, rejected, attempts, last_error
       FROM mutations {filter} ORDER BY rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Vec<u8>>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, bool>(4)?,
        row.get::<_, bool>(5)?,
        row.get::<_, u32>(6)?,
        row.get::<_, Option<String>>(7)?,
      ))
    })?;

    let mut mutations = Vec::new();
    for row in rows {
      let (id, action, payload, created_at, synced, rejected, attempts, last_error) = row?;
      mutations.push(PendingMutation {
        id: Uuid::parse_str(&id)
          .map_err(|e| EngineError::InvalidRecord(format!("mutation id {id}: {e}")))?,
        action,
        payload: serde_json::from_slice(&payload)?,
        created_at: parse_datetime(&created_at)?,
        synced,
        rejected,
        attempts,
        last_error,
      });
    }
    Ok(mutations)
  }

  /// Record a confirmed server success. Kept separate from deletion so a
  /// crash between the two leaves a synced row that the next drain purges
  /// instead of resubmitting.
  pub fn mark_synced(&self, id: &Uuid) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations SET synced = 1 WHERE id = ?",
      params![id.to_string()],
    )?;
    Ok(())
  }

  pub fn delete_mutation(&self, id: &Uuid) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM mutations WHERE id = ?", params![id.to_string()])?;
    Ok(())
  }

  /// Drop rows the server already confirmed (crash leftovers). Returns how
  /// many were removed.
  pub fn purge_synced(&self) -> Result<usize> {
    let conn = self.lock()?;
    let purged = conn.execute("DELETE FROM mutations WHERE synced = 1", [])?;
    Ok(purged)
  }

  pub fn record_attempt(&self, id: &Uuid, error: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations SET attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id.to_string()],
    )?;
    Ok(())
  }

  pub fn mark_rejected(&self, id: &Uuid, error: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations SET rejected = 1, attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id.to_string()],
    )?;
    Ok(())
  }

  pub fn queue_status(&self) -> Result<QueueStatus> {
    let conn = self.lock()?;
    let (pending, oldest): (i64, Option<String>) = conn.query_row(
      "SELECT COUNT(*), MIN(created_at) FROM mutations WHERE synced = 0 AND rejected = 0",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let rejected: i64 = conn.query_row(
      "SELECT COUNT(*) FROM mutations WHERE rejected = 1",
      [],
      |row| row.get(0),
    )?;

    Ok(QueueStatus {
      pending: pending as usize,
      rejected: rejected as usize,
      oldest_pending: oldest.map(|s| parse_datetime(&s)).transpose()?,
    })
  }

  // ============================================================================
  // Push subscriptions
  // ============================================================================

  pub fn put_subscription(&self, record: &PushSubscriptionRecord) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO push_subscriptions (endpoint, p256dh, auth, created_at)
       VALUES (?, ?, ?, ?)",
      params![
        record.endpoint,
        record.p256dh,
        record.auth,
        record.created_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  pub fn get_subscription(&self, endpoint: &str) -> Result<Option<PushSubscriptionRecord>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT endpoint, p256dh, auth, created_at FROM push_subscriptions WHERE endpoint = ?",
        params![endpoint],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
          ))
        },
      )
      .optional()?;

    row
      .map(|(endpoint, p256dh, auth, created_at)| {
        Ok(PushSubscriptionRecord {
          endpoint,
          p256dh,
          auth,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .transpose()
  }

  pub fn delete_subscription(&self, endpoint: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM push_subscriptions WHERE endpoint = ?",
      params![endpoint],
    )?;
    Ok(())
  }

  // ============================================================================
  // Version marker
  // ============================================================================

  pub fn current_version(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    let version = conn
      .query_row(
        "SELECT value FROM meta WHERE key = 'cache_version'",
        [],
        |row| row.get::<_, String>(0),
      )
      .optional()?;
    Ok(version)
  }

  pub fn set_current_version(&self, version: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES ('cache_version', ?)",
      params![version],
    )?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::InvalidRecord(format!("timestamp '{s}': {e}")))
}
