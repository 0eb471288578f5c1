//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::key::RequestKey;
use crate::http::Response;

/// A single cached response.
#[derive(Debug)]
pub struct CachedEntry {
  /// The cached response
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Summary of one named cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
  pub name: String,
  pub entries: usize,
  /// Set once an install into this cache has settled
  pub installed_at: Option<DateTime<Utc>>,
}

/// Trait for cache storage backends.
///
/// Storage is partitioned into named caches (one per cache version). Every
/// method is atomic on its own; callers never hold locks across calls.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet, and clear its
  /// installed flag so a new install has to settle again before activation.
  fn open_cache(&self, name: &str) -> Result<()>;

  /// Names of all existing caches, oldest first.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and everything in it. Returns false if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry under the same key.
  /// Creates the cache if needed.
  fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Look up a response.
  fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// URLs of every entry in a cache.
  fn keys(&self, cache: &str) -> Result<Vec<String>>;

  /// Persist the asset manifest a cache was installed from.
  fn store_manifest(&self, cache: &str, assets: &[Url]) -> Result<()>;

  /// The asset manifest recorded for a cache, in order.
  fn manifest(&self, cache: &str) -> Result<Vec<String>>;

  /// Record that install into this cache has settled.
  fn mark_installed(&self, cache: &str) -> Result<()>;

  /// Whether install into this cache has settled.
  fn is_installed(&self, cache: &str) -> Result<bool>;

  /// Summaries of all caches, oldest first.
  fn list_caches(&self) -> Result<Vec<CacheInfo>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
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
  pub fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("precache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache version
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    installed_at TEXT
);

-- Cached responses, keyed by request hash within a cache
CREATE TABLE IF NOT EXISTS entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

-- Asset manifest each cache was installed from (preserves order)
CREATE TABLE IF NOT EXISTS manifests (
    cache_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    url TEXT NOT NULL,
    PRIMARY KEY (cache_name, position)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT INTO caches (name, created_at) VALUES (?, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET installed_at = NULL",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    tx.execute("DELETE FROM manifests WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete manifest of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (cache_name, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        key.cache_hash(),
        key.url().as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE cache_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![cache, key.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key.description(), e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }

  fn store_manifest(&self, cache: &str, assets: &[Url]) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM manifests WHERE cache_name = ?", params![cache])
      .map_err(|e| eyre!("Failed to clear manifest of {}: {}", cache, e))?;

    for (position, url) in assets.iter().enumerate() {
      tx.execute(
        "INSERT INTO manifests (cache_name, position, url) VALUES (?, ?, ?)",
        params![cache, position, url.as_str()],
      )
      .map_err(|e| eyre!("Failed to store manifest entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn manifest(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT url FROM manifests WHERE cache_name = ? ORDER BY position")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read manifest of {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read manifest entry: {}", e))?;

    Ok(urls)
  }

  fn mark_installed(&self, cache: &str) -> Result<()> {
    let conn = self.conn()?;

    let updated = conn
      .execute(
        "UPDATE caches SET installed_at = datetime('now') WHERE name = ?",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to mark {} installed: {}", cache, e))?;

    if updated == 0 {
      return Err(eyre!("Cache {} does not exist", cache));
    }

    Ok(())
  }

  fn is_installed(&self, cache: &str) -> Result<bool> {
    let conn = self.conn()?;

    let installed_at: Option<Option<String>> = conn
      .query_row(
        "SELECT installed_at FROM caches WHERE name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache {}: {}", cache, e))?;

    Ok(installed_at.flatten().is_some())
  }

  fn list_caches(&self) -> Result<Vec<CacheInfo>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT c.name, c.installed_at, COUNT(e.request_key) FROM caches c
         LEFT JOIN entries e ON e.cache_name = c.name
         GROUP BY c.name
         ORDER BY c.created_at, c.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, installed_at, entries)| {
        Ok(CacheInfo {
          name,
          entries: entries as usize,
          installed_at: installed_at.as_deref().map(parse_datetime).transpose()?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().expect("in-memory storage")
  }

  #[test]
  fn test_put_then_get_returns_response() {
    let storage = storage();
    let key = RequestKey::get(&url("https://example.org/index.html"));
    let response = Response::new(200, "<html></html>").with_header("content-type", "text/html");

    storage.put("v1", &key, &response).unwrap();

    let entry = storage.get("v1", &key).unwrap().expect("entry should exist");
    assert_eq!(entry.response, response);
    assert!(entry.cached_at <= Utc::now());
  }

  #[test]
  fn test_get_is_scoped_to_cache_name() {
    let storage = storage();
    let key = RequestKey::get(&url("https://example.org/app.js"));
    storage.put("v1", &key, &Response::new(200, "old")).unwrap();

    assert!(storage.get("v2", &key).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = storage();
    let key = RequestKey::get(&url("https://example.org/app.js"));
    storage.put("v1", &key, &Response::new(200, "first")).unwrap();
    storage.put("v1", &key, &Response::new(200, "second")).unwrap();

    let entry = storage.get("v1", &key).unwrap().unwrap();
    assert_eq!(entry.response.text(), "second");
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_put_creates_cache() {
    let storage = storage();
    let key = RequestKey::get(&url("https://example.org/a"));
    storage.put("v3", &key, &Response::new(200, "a")).unwrap();

    assert_eq!(storage.cache_names().unwrap(), vec!["v3".to_string()]);
  }

  #[test]
  fn test_open_cache_is_idempotent() {
    let storage = storage();
    storage.open_cache("v1").unwrap();
    storage.open_cache("v1").unwrap();

    assert_eq!(storage.cache_names().unwrap(), vec!["v1".to_string()]);
  }

  #[test]
  fn test_delete_cache_removes_entries_and_manifest() {
    let storage = storage();
    let asset = url("https://example.org/index.html");
    let key = RequestKey::get(&asset);
    storage.open_cache("v1").unwrap();
    storage.store_manifest("v1", &[asset]).unwrap();
    storage.put("v1", &key, &Response::new(200, "x")).unwrap();

    assert!(storage.delete_cache("v1").unwrap());

    assert!(storage.cache_names().unwrap().is_empty());
    assert!(storage.get("v1", &key).unwrap().is_none());
    assert!(storage.manifest("v1").unwrap().is_empty());
  }

  #[test]
  fn test_delete_missing_cache_returns_false() {
    let storage = storage();
    assert!(!storage.delete_cache("nope").unwrap());
  }

  #[test]
  fn test_manifest_preserves_order() {
    let storage = storage();
    let assets = vec![
      url("https://example.org/z.js"),
      url("https://example.org/a.js"),
      url("https://example.org/index.html"),
    ];
    storage.open_cache("v1").unwrap();
    storage.store_manifest("v1", &assets).unwrap();

    let stored = storage.manifest("v1").unwrap();
    let expected: Vec<String> = assets.iter().map(|u| u.to_string()).collect();
    assert_eq!(stored, expected);
  }

  #[test]
  fn test_installed_flag() {
    let storage = storage();
    storage.open_cache("v1").unwrap();
    assert!(!storage.is_installed("v1").unwrap());

    storage.mark_installed("v1").unwrap();
    assert!(storage.is_installed("v1").unwrap());
    assert!(!storage.is_installed("missing").unwrap());
  }

  #[test]
  fn test_reopening_cache_clears_installed_flag() {
    let storage = storage();
    storage.open_cache("v1").unwrap();
    let key = RequestKey::get(&url("https://example.org/index.html"));
    storage.put("v1", &key, &Response::new(200, "<html>")).unwrap();
    storage.mark_installed("v1").unwrap();

    storage.open_cache("v1").unwrap();

    assert!(!storage.is_installed("v1").unwrap());
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_mark_installed_requires_cache() {
    let storage = storage();
    assert!(storage.mark_installed("missing").is_err());
  }

  #[test]
  fn test_list_caches_counts_entries() {
    let storage = storage();
    storage.open_cache("empty").unwrap();
    storage
      .put("full", &RequestKey::get(&url("https://example.org/a")), &Response::new(200, "a"))
      .unwrap();
    storage
      .put("full", &RequestKey::get(&url("https://example.org/b")), &Response::new(200, "b"))
      .unwrap();
    storage.mark_installed("full").unwrap();

    let caches = storage.list_caches().unwrap();
    let empty = caches.iter().find(|c| c.name == "empty").unwrap();
    let full = caches.iter().find(|c| c.name == "full").unwrap();
    assert_eq!(empty.entries, 0);
    assert!(empty.installed_at.is_none());
    assert_eq!(full.entries, 2);
    assert!(full.installed_at.is_some());
  }

  #[test]
  fn test_entries_survive_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("nested").join("cache.db");
    let asset = url("https://example.org/index.html");
    let key = RequestKey::get(&asset);

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.open_cache("v1").unwrap();
      storage.store_manifest("v1", &[asset.clone()]).unwrap();
      storage.put("v1", &key, &Response::new(200, "persisted")).unwrap();
      storage.mark_installed("v1").unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let entry = storage.get("v1", &key).unwrap().expect("entry should persist");
    assert_eq!(entry.response.text(), "persisted");
    assert_eq!(storage.manifest("v1").unwrap(), vec![asset.to_string()]);
    assert!(storage.is_installed("v1").unwrap());
  }
}
