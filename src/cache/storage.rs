//! Named-cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::Mutex;
use url::Url;

use super::traits::{Response, ResponseKind};

/// A response found in a named cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// Name of the cache that held it
  pub cache_name: String,
  /// When the entry was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for named-cache backends.
///
/// Caches are created on first write and listed in creation order.
pub trait CacheStorage: Send + Sync {
  /// Names of all existing caches, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a whole cache. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request URL across every cache, oldest cache first.
  fn match_url(&self, url: &Url) -> Result<Option<CachedResponse>>;

  /// Look up a request URL in one cache.
  fn match_in(&self, name: &str, url: &Url) -> Result<Option<CachedResponse>>;

  /// Store one response under a request URL.
  fn put(&self, name: &str, url: &Url, response: &Response) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, name: &str, entries: &[(Url, Response)]) -> Result<()>;

  /// Number of entries held by a cache.
  fn entry_count(&self, name: &str) -> Result<usize>;

  /// Name of the generation last activated, if any.
  fn active_generation(&self) -> Result<Option<String>>;

  /// Record `name` as the activated generation.
  fn set_active_generation(&self, name: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open or create cache storage at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Cache storage that lives only as long as this value.
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

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named cache; id preserves creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request URL
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_id, url),
    FOREIGN KEY (cache_id) REFERENCES caches(id)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);

-- Single row naming the activated generation
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const ENTRY_COLUMNS: &str =
  "e.response_url, e.status, e.kind, e.content_type, e.body, e.cached_at, c.name";

impl CacheStorage for SqliteCacheStorage {
  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_id IN (SELECT id FROM caches WHERE name = ?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_url(&self, url: &Url) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM cache_entries e
       INNER JOIN caches c ON c.id = e.cache_id
       WHERE e.url = ?
       ORDER BY c.id
       LIMIT 1",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![cache_key(url)], read_entry)
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", url, e))?;

    row.map(StoredEntry::into_cached).transpose()
  }

  fn match_in(&self, name: &str, url: &Url) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM cache_entries e
       INNER JOIN caches c ON c.id = e.cache_id
       WHERE c.name = ? AND e.url = ?",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![name, cache_key(url)], read_entry)
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", url, name, e))?;

    row.map(StoredEntry::into_cached).transpose()
  }

  fn put(&self, name: &str, url: &Url, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let cache_id = ensure_cache(&tx, name)?;
    store_entry(&tx, cache_id, url, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Url, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction on error rolls every entry back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let cache_id = ensure_cache(&tx, name)?;
    for (url, response) in entries {
      store_entry(&tx, cache_id, url, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries e
         INNER JOIN caches c ON c.id = e.cache_id
         WHERE c.name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(count as usize)
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row("SELECT active FROM registration WHERE id = 1", [], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))
  }

  fn set_active_generation(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO registration (id, active, activated_at) VALUES (1, ?, datetime('now'))",
        params![name],
      )
      .map_err(|e| eyre!("Failed to record active generation {}: {}", name, e))?;

    Ok(())
  }
}

/// Entries are keyed by URL without its fragment.
fn cache_key(url: &Url) -> String {
  let mut key = url.clone();
  key.set_fragment(None);
  key.into()
}

/// Create the named cache if absent and return its id.
fn ensure_cache(tx: &Transaction<'_>, name: &str) -> Result<i64> {
  tx.execute(
    "INSERT OR IGNORE INTO caches (name) VALUES (?)",
    params![name],
  )
  .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;

  tx.query_row(
    "SELECT id FROM caches WHERE name = ?",
    params![name],
    |row| row.get(0),
  )
  .map_err(|e| eyre!("Failed to read cache {}: {}", name, e))
}

fn store_entry(tx: &Transaction<'_>, cache_id: i64, url: &Url, response: &Response) -> Result<()> {
  tx.execute(
    "INSERT OR REPLACE INTO cache_entries (cache_id, url, response_url, status, kind, content_type, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      cache_id,
      cache_key(url),
      response.url.as_str(),
      response.status,
      response.kind.as_str(),
      response.content_type,
      response.body,
    ],
  )
  .map_err(|e| eyre!("Failed to store {}: {}", url, e))?;

  Ok(())
}

/// Raw row, converted outside the rusqlite closure so parse errors keep context.
struct StoredEntry {
  response_url: String,
  status: u16,
  kind: String,
  content_type: Option<String>,
  body: Vec<u8>,
  cached_at: String,
  cache_name: String,
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<StoredEntry> {
  Ok(StoredEntry {
    response_url: row.get(0)?,
    status: row.get(1)?,
    kind: row.get(2)?,
    content_type: row.get(3)?,
    body: row.get(4)?,
    cached_at: row.get(5)?,
    cache_name: row.get(6)?,
  })
}

impl StoredEntry {
  fn into_cached(self) -> Result<CachedResponse> {
    let url = Url::parse(&self.response_url)
      .map_err(|e| eyre!("Failed to parse cached URL '{}': {}", self.response_url, e))?;
    let kind = ResponseKind::parse(&self.kind)
      .ok_or_else(|| eyre!("Unknown response kind '{}'", self.kind))?;

    Ok(CachedResponse {
      response: Response {
        url,
        status: self.status,
        kind,
        content_type: self.content_type,
        body: self.body,
      },
      cache_name: self.cache_name,
      cached_at: parse_datetime(&self.cached_at)?,
    })
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

  fn response(path: &str, body: &str) -> (Url, Response) {
    let url = Url::parse("http://localhost:8080").unwrap().join(path).unwrap();
    let response = Response {
      url: url.clone(),
      status: 200,
      kind: ResponseKind::Basic,
      content_type: Some("text/plain".into()),
      body: body.as_bytes().to_vec(),
    };
    (url, response)
  }

  #[test]
  fn test_put_and_match() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    let (url, resp) = response("/clases/app.js", "console.log(1)");
    storage.put("v1", &url, &resp).unwrap();

    let hit = storage.match_url(&url).unwrap().unwrap();
    assert_eq!(hit.response, resp);
    assert_eq!(hit.cache_name, "v1");
    assert!(Utc::now() - hit.cached_at < chrono::Duration::minutes(5));
    assert!(storage.match_in("v2", &url).unwrap().is_none());
  }

  #[test]
  fn test_keys_in_creation_order_and_delete() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    let (url, resp) = response("/a", "a");
    storage.put("zeta", &url, &resp).unwrap();
    storage.put("alpha", &url, &resp).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["zeta", "alpha"]);

    // Oldest cache wins on a cross-cache match
    assert_eq!(storage.match_url(&url).unwrap().unwrap().cache_name, "zeta");

    assert!(storage.delete("zeta").unwrap());
    assert!(!storage.delete("zeta").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["alpha"]);
    assert_eq!(storage.match_url(&url).unwrap().unwrap().cache_name, "alpha");
  }

  #[test]
  fn test_put_all_counts() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    let entries = vec![response("/a", "a"), response("/b", "b")];
    storage.put_all("v1", &entries).unwrap();
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
    assert_eq!(storage.entry_count("missing").unwrap(), 0);
  }

  #[test]
  fn test_fragment_is_ignored() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    let (url, resp) = response("/clases/app.js", "app");
    storage.put("v1", &url, &resp).unwrap();

    let with_fragment = Url::parse("http://localhost:8080/clases/app.js#x").unwrap();
    assert!(storage.match_url(&with_fragment).unwrap().is_some());
    assert!(storage.match_in("v1", &with_fragment).unwrap().is_some());

    // Storing under a fragment overwrites the same entry
    storage.put("v1", &with_fragment, &resp).unwrap();
    assert_eq!(storage.entry_count("v1").unwrap(), 1);
  }

  #[test]
  fn test_active_generation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let storage = SqliteCacheStorage::open(&path).unwrap();
    assert_eq!(storage.active_generation().unwrap(), None);

    storage.set_active_generation("v1").unwrap();
    storage.set_active_generation("v2").unwrap();
    drop(storage);

    let reopened = SqliteCacheStorage::open(&path).unwrap();
    assert_eq!(reopened.active_generation().unwrap().as_deref(), Some("v2"));
  }

  #[test]
  fn test_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let (url, resp) = response("/index.html", "<html>");
    SqliteCacheStorage::open(&path)
      .unwrap()
      .put("v1", &url, &resp)
      .unwrap();

    let reopened = SqliteCacheStorage::open(&path).unwrap();
    assert_eq!(reopened.match_url(&url).unwrap().unwrap().response.body, b"<html>");
  }
}
