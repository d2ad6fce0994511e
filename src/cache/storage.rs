//! Cache store backends: SQLite on disk and an in-memory map.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStore, CachedResponse, MatchOptions};
use crate::error::StoreError;
use crate::request::{RequestKey, Response};

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> color_eyre::Result<Self> {
    let path = Self::default_path()?;
    Ok(Self::open(&path)?)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> color_eyre::Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| color_eyre::eyre::eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per stored response. rowid order is insertion order.
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL REFERENCES generations(name) ON DELETE CASCADE,
    key_hash TEXT NOT NULL,
    match_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_match ON entries(generation, match_hash);
"#;

const INSERT_ENTRY: &str = "INSERT OR REPLACE INTO entries
   (generation, key_hash, match_hash, method, url, status, headers, body, stored_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<(), StoreError> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    INSERT_ENTRY,
    params![
      generation,
      key.hash(),
      key.match_hash(),
      key.method(),
      key.url(),
      response.status,
      headers,
      response.body.as_ref(),
      Utc::now().to_rfc3339(),
    ],
  )?;
  Ok(())
}

fn generation_exists(conn: &Connection, generation: &str) -> Result<bool, StoreError> {
  let found = conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![generation],
      |_| Ok(()),
    )
    .optional()?;
  Ok(found.is_some())
}

impl CacheStore for SqliteStore {
  fn open(&self, generation: &str) -> Result<(), StoreError> {
    self.lock()?.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )?;
    Ok(())
  }

  fn get(
    &self,
    generation: &str,
    key: &RequestKey,
    options: MatchOptions,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let conn = self.lock()?;

    let (sql, hash) = if options.ignore_query {
      (
        "SELECT url, status, headers, body, stored_at FROM entries
         WHERE generation = ? AND match_hash = ?
         ORDER BY rowid LIMIT 1",
        key.match_hash(),
      )
    } else {
      (
        "SELECT url, status, headers, body, stored_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        key.hash(),
      )
    };

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(sql, params![generation, hash], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()?;

    match row {
      Some((url, status, headers, body, stored_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body: Bytes::from(body),
        },
        url,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let conn = self.lock()?;
    if !generation_exists(&conn, generation)? {
      return Err(StoreError::UnknownGeneration(generation.to_string()));
    }
    insert_entry(&conn, generation, key, response)
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    tx.commit()?;
    Ok(())
  }

  fn delete(&self, generation: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "DELETE FROM entries WHERE generation = ?",
      params![generation],
    )?;
    let removed = tx.execute(
      "DELETE FROM generations WHERE name = ?",
      params![generation],
    )?;

    tx.commit()?;
    Ok(removed > 0)
  }

  fn generation_ids(&self) -> Result<BTreeSet<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM generations")?;
    let ids = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// In-memory store. Used for `--ephemeral` runs and in tests.
#[derive(Default)]
pub struct MemoryStore {
  generations: Mutex<BTreeMap<String, Vec<MemoryEntry>>>,
}

struct MemoryEntry {
  key: RequestKey,
  cached: CachedResponse,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<MemoryEntry>>>, StoreError> {
    self.generations.lock().map_err(|_| StoreError::Poisoned)
  }
}

fn upsert(entries: &mut Vec<MemoryEntry>, key: &RequestKey, response: &Response) {
  // Replacing re-inserts at the end, matching the SQLite rowid behaviour.
  entries.retain(|e| !e.key.matches(key, false));
  entries.push(MemoryEntry {
    key: key.clone(),
    cached: CachedResponse {
      response: response.clone(),
      url: key.url().to_string(),
      stored_at: Utc::now(),
    },
  });
}

impl CacheStore for MemoryStore {
  fn open(&self, generation: &str) -> Result<(), StoreError> {
    self.lock()?.entry(generation.to_string()).or_default();
    Ok(())
  }

  fn get(
    &self,
    generation: &str,
    key: &RequestKey,
    options: MatchOptions,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let generations = self.lock()?;
    Ok(generations.get(generation).and_then(|entries| {
      entries
        .iter()
        .find(|e| e.key.matches(key, options.ignore_query))
        .map(|e| e.cached.clone())
    }))
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let mut generations = self.lock()?;
    let entries = generations
      .get_mut(generation)
      .ok_or_else(|| StoreError::UnknownGeneration(generation.to_string()))?;
    upsert(entries, key, response);
    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<(), StoreError> {
    let mut generations = self.lock()?;
    let stored = generations.entry(generation.to_string()).or_default();
    for (key, response) in entries {
      upsert(stored, key, response);
    }
    Ok(())
  }

  fn delete(&self, generation: &str) -> Result<bool, StoreError> {
    Ok(self.lock()?.remove(generation).is_some())
  }

  fn generation_ids(&self) -> Result<BTreeSet<String>, StoreError> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn key(url: &str) -> RequestKey {
    RequestKey::new(&Method::GET, &Url::parse(url).unwrap())
  }

  fn page(body: &str) -> Response {
    Response::new(200, body.to_string()).with_header("content-type", "text/html")
  }

  /// Contract checks shared by both backends.
  fn exercise_store(store: &dyn CacheStore) {
    assert!(store.generation_ids().unwrap().is_empty());

    store.open("app-v1").unwrap();
    store
      .put("app-v1", &key("https://app.test/index.html"), &page("one"))
      .unwrap();

    // Exact lookups respect the query string
    assert!(store
      .get("app-v1", &key("https://app.test/index.html?x=1"), MatchOptions::default())
      .unwrap()
      .is_none());

    let hit = store
      .get(
        "app-v1",
        &key("https://app.test/index.html?x=1"),
        MatchOptions::ignoring_query(),
      )
      .unwrap()
      .expect("query-less match");
    assert_eq!(hit.response.body, Bytes::from("one"));
    assert_eq!(hit.response.header("Content-Type"), Some("text/html"));
    assert_eq!(hit.url, "https://app.test/index.html");

    // Overwrite is not an error and replaces the value
    store
      .put("app-v1", &key("https://app.test/index.html"), &page("two"))
      .unwrap();
    let hit = store
      .get("app-v1", &key("https://app.test/index.html"), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, Bytes::from("two"));

    // Writes into a generation that was never opened fail
    assert!(matches!(
      store.put("app-v0", &key("https://app.test/"), &page("x")),
      Err(StoreError::UnknownGeneration(_))
    ));

    store
      .put_all(
        "app-v2",
        &[
          (key("https://app.test/"), page("root")),
          (key("https://app.test/icon.svg"), page("svg")),
        ],
      )
      .unwrap();
    assert_eq!(
      store.generation_ids().unwrap().into_iter().collect::<Vec<_>>(),
      vec!["app-v1".to_string(), "app-v2".to_string()]
    );

    assert!(store.delete("app-v1").unwrap());
    assert!(!store.delete("app-v1").unwrap());
    assert!(store
      .get("app-v1", &key("https://app.test/index.html"), MatchOptions::default())
      .unwrap()
      .is_none());
    assert!(store
      .get("app-v2", &key("https://app.test/icon.svg"), MatchOptions::default())
      .unwrap()
      .is_some());
  }

  #[test]
  fn test_memory_store_contract() {
    exercise_store(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("cache.db")).unwrap();
    exercise_store(&store);
  }

  #[test]
  fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store
        .put_all("app-v1", &[(key("https://app.test/index.html"), page("shell"))])
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let hit = store
      .get("app-v1", &key("https://app.test/index.html"), MatchOptions::default())
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, Bytes::from("shell"));
    assert!(hit.stored_at <= Utc::now());
  }

  #[test]
  fn test_ignore_query_prefers_earliest_entry() {
    let store = MemoryStore::new();
    store.open("g").unwrap();
    store.put("g", &key("https://app.test/a?v=1"), &page("first")).unwrap();
    store.put("g", &key("https://app.test/a?v=2"), &page("second")).unwrap();

    let hit = store
      .get("g", &key("https://app.test/a"), MatchOptions::ignoring_query())
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, Bytes::from("first"));
  }
}
