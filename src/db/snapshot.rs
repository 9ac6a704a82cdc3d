//! Snapshot codec: SQLite byte image <-> JSON numeric array.
//!
//! The byte image is the on-disk SQLite file format, produced and consumed with
//! the online backup API through a scratch file.

use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};

use super::error::{PersistError, SnapshotError};

const SCRATCH_FILE: &str = "snapshot.db";

/// Export the full database image of `conn`.
pub fn export(conn: &Connection) -> Result<Vec<u8>, PersistError> {
  let dir = tempfile::tempdir()?;
  let path = dir.path().join(SCRATCH_FILE);

  conn
    .backup(DatabaseName::Main, &path, None)
    .map_err(|e| PersistError::Export(e.to_string()))?;

  Ok(std::fs::read(&path)?)
}

/// Reconstruct an in-memory database from an exported image.
pub fn import(bytes: &[u8]) -> Result<Connection, SnapshotError> {
  let dir = tempfile::tempdir()?;
  let path = dir.path().join(SCRATCH_FILE);
  std::fs::write(&path, bytes)?;

  let mut conn = Connection::open_in_memory()?;
  conn.restore(DatabaseName::Main, &path, None::<fn(Progress)>)?;

  // A valid header over damaged pages restores fine but fails on first query
  let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
  if check != "ok" {
    return Err(SnapshotError::Integrity(check));
  }

  Ok(conn)
}

/// Encode an image as a JSON array of byte values.
pub fn encode(bytes: &[u8]) -> Result<String, PersistError> {
  Ok(serde_json::to_string(bytes)?)
}

/// Decode a JSON array of byte values. Values outside 0..=255 are rejected.
pub fn decode(value: &str) -> Result<Vec<u8>, SnapshotError> {
  Ok(serde_json::from_str::<Vec<u8>>(value)?)
}
