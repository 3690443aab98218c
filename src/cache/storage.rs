//! SQLite implementation of the cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{request_hash, CacheStorage, CachedResponse};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
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
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("neydra-sw").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache version, id gives creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by SHA256 of the request URL
CREATE TABLE IF NOT EXISTS responses (
    cache_id INTEGER NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_id, request_key),
    FOREIGN KEY (cache_id) REFERENCES caches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_responses_key ON responses(request_key);
"#;

/// Raw row as read from `responses`.
type RawEntry = (String, u16, String, Vec<u8>, String);

const SELECT_ENTRY: &str = "SELECT r.url, r.status, r.headers, r.body, r.cached_at
     FROM responses r INNER JOIN caches c ON c.id = r.cache_id";

fn ensure_cache(conn: &Connection, cache: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache, e))?;

  conn
    .query_row(
      "SELECT id FROM caches WHERE name = ?",
      params![cache],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up cache {}: {}", cache, e))
}

fn insert_entry(conn: &Connection, cache_id: i64, entry: &CachedResponse) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses
         (cache_id, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        cache_id,
        entry.key(),
        entry.url,
        entry.status,
        headers,
        &entry.body[..],
        entry.cached_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", entry.url, e))?;

  Ok(())
}

/// Cache names selected by `sql`, in the order it returns them.
fn query_names(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let names = stmt
    .query_map(params, |row| row.get(0))
    .map_err(|e| eyre!("Failed to list caches: {}", e))?
    .collect::<rusqlite::Result<Vec<String>>>()
    .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

  Ok(names)
}

fn decode_entry((url, status, headers, body, cached_at): RawEntry) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
  let cached_at = parse_datetime(&cached_at)?;

  Ok(CachedResponse {
    url,
    status,
    headers,
    body: body.into(),
    cached_at,
  })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn open(&self, cache: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_cache(&conn, cache)?;
    Ok(())
  }

  async fn has(&self, cache: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM caches WHERE name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache, e))?;

    Ok(found.is_some())
  }

  async fn names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    query_names(&conn, "SELECT name FROM caches ORDER BY id", [])
  }

  async fn delete(&self, cache: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM responses WHERE cache_id IN (SELECT id FROM caches WHERE name = ?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  async fn delete_except(&self, keep: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let doomed = query_names(
      &tx,
      "SELECT name FROM caches WHERE name != ? ORDER BY id",
      params![keep],
    )?;

    tx.execute(
      "DELETE FROM responses WHERE cache_id IN (SELECT id FROM caches WHERE name != ?)",
      params![keep],
    )
    .map_err(|e| eyre!("Failed to delete stale entries: {}", e))?;
    tx.execute("DELETE FROM caches WHERE name != ?", params![keep])
      .map_err(|e| eyre!("Failed to delete stale caches: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(doomed)
  }

  async fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()> {
    let conn = self.lock()?;
    let cache_id = ensure_cache(&conn, cache)?;
    insert_entry(&conn, cache_id, entry)
  }

  async fn put_all(&self, cache: &str, entries: &[CachedResponse]) -> Result<()> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let cache_id = ensure_cache(&tx, cache)?;
    for entry in entries {
      insert_entry(&tx, cache_id, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  async fn get(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("{} WHERE c.name = ? AND r.request_key = ?", SELECT_ENTRY),
        params![cache, request_hash(url)],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", url, cache, e))?;

    raw.map(decode_entry).transpose()
  }

  async fn match_any(&self, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!(
          "{} WHERE r.request_key = ? ORDER BY c.id LIMIT 1",
          SELECT_ENTRY
        ),
        params![request_hash(url)],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", url, e))?;

    raw.map(decode_entry).transpose()
  }

  async fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT r.url FROM responses r INNER JOIN caches c ON c.id = r.cache_id
         WHERE c.name = ? ORDER BY r.url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
