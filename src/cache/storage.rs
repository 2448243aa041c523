//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use rusqlite::{params, OptionalExtension};

use crate::db::{format_datetime, parse_datetime, Database};
use crate::http::{Headers, RequestKey};

use super::entry::{CacheEntry, EntrySummary};
use super::generation::{CacheGeneration, StoreKind, StoreName};

/// Trait for cache storage backends.
///
/// `put` and `delete_store` are the units of atomicity; no operation spans
/// more than one key except `delete_store`.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open_store(&self, store: &StoreName) -> Result<()>;

  /// Look up a single entry.
  fn get(&self, store: &StoreName, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any prior entry with the same key. Creates
  /// the store if needed.
  fn put(&self, store: &StoreName, entry: &CacheEntry) -> Result<()>;

  /// Like `put`, but only into a store that still exists. Returns `false`
  /// and writes nothing once the store has been deleted.
  fn put_existing(&self, store: &StoreName, entry: &CacheEntry) -> Result<bool>;

  /// Remove a store and all of its entries. Returns whether it existed.
  fn delete_store(&self, store: &StoreName) -> Result<bool>;

  /// Metadata for every entry of a store, ordered by key.
  fn list_entries(&self, store: &StoreName) -> Result<Vec<EntrySummary>>;

  /// Every store currently present.
  fn list_stores(&self) -> Result<Vec<StoreName>>;

  /// Sum of body sizes across all stores.
  fn total_byte_size(&self) -> Result<u64>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_store(&self, store: &StoreName) -> Result<()> {
    let conn = self.db.lock()?;
    insert_store_row(&conn, store)
  }

  fn get(&self, store: &StoreName, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, method, status, headers, body, stored_at FROM cache_entries
         WHERE store_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, String, u16, String, Vec<u8>, String)> = stmt
      .query_row(params![store.qualified(), key.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {} from {}: {}", key, store, e))?;

    let Some((url, method, status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let status = StatusCode::from_u16(status)
      .map_err(|e| eyre!("Invalid stored status for {}: {}", key, e))?;
    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

    Ok(Some(CacheEntry {
      key: key.clone(),
      url,
      method,
      status,
      headers,
      body,
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn put(&self, store: &StoreName, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store_row(&tx, store)?;
    insert_entry(&tx, store, entry)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_existing(&self, store: &StoreName, entry: &CacheEntry) -> Result<bool> {
    // Check and write under one lock so a concurrent delete_store cannot
    // slip in between.
    let conn = self.db.lock()?;

    let exists: bool = conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_stores WHERE name = ?)",
        params![store.qualified()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up store {}: {}", store, e))?;

    if !exists {
      return Ok(false);
    }

    insert_entry(&conn, store, entry)?;
    Ok(true)
  }

  fn delete_store(&self, store: &StoreName) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let name = store.qualified();

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

  fn list_entries(&self, store: &StoreName) -> Result<Vec<EntrySummary>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT request_key, url, LENGTH(body), body_sha256, stored_at FROM cache_entries
         WHERE store_name = ?
         ORDER BY request_key",
      )
      .map_err(|e| eyre!("Failed to prepare entry listing: {}", e))?;

    let rows: Vec<(String, String, i64, String, String)> = stmt
      .query_map(params![store.qualified()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", store, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entry row of {}: {}", store, e))?;

    rows
      .into_iter()
      .map(|(key, url, size, digest, stored_at)| {
        Ok(EntrySummary {
          key: RequestKey::from_stored(key),
          url,
          size: size.max(0) as u64,
          digest,
          stored_at: parse_datetime(&stored_at)?,
        })
      })
      .collect()
  }

  fn list_stores(&self) -> Result<Vec<StoreName>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT kind, release FROM cache_stores ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare store listing: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read store row: {}", e))?;

    rows
      .into_iter()
      .map(|(kind, release)| {
        let kind = StoreKind::parse(&kind).ok_or_else(|| eyre!("Unknown store kind '{}'", kind))?;
        Ok(StoreName {
          kind,
          generation: CacheGeneration::new(release),
        })
      })
      .collect()
  }

  fn total_byte_size(&self) -> Result<u64> {
    let conn = self.db.lock()?;

    let total: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to compute cache size: {}", e))?;

    Ok(total.max(0) as u64)
  }
}

fn insert_entry(conn: &rusqlite::Connection, store: &StoreName, entry: &CacheEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (store_name, request_key, url, method, status, headers, body, body_sha256, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        store.qualified(),
        entry.key.as_str(),
        entry.url,
        entry.method,
        entry.status.as_u16(),
        headers,
        entry.body,
        entry.digest(),
        format_datetime(&entry.stored_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;
  Ok(())
}

fn insert_store_row(conn: &rusqlite::Connection, store: &StoreName) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name, kind, release, created_at) VALUES (?, ?, ?, ?)",
      params![
        store.qualified(),
        store.kind.as_str(),
        store.generation.release(),
        format_datetime(&Utc::now()),
      ],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;
  Ok(())
}
