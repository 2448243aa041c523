//! Durable FIFO of mutating requests waiting for connectivity.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{format_datetime, parse_datetime, Database};
use crate::http::RequestRecord;

/// A pending write. `id` is monotonic, so id order is enqueue order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
  pub id: i64,
  pub payload: RequestRecord,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
}

/// A queue row as stored, before its payload is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawQueueItem {
  pub id: i64,
  pub payload: String,
  created_at: String,
  pub attempt_count: u32,
  pub last_error: Option<String>,
}

impl RawQueueItem {
  pub fn decode(&self) -> Result<QueueItem> {
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize queued write {}: {}", self.id, e))?;

    Ok(QueueItem {
      id: self.id,
      payload,
      created_at: parse_datetime(&self.created_at)?,
      attempt_count: self.attempt_count,
      last_error: self.last_error.clone(),
    })
  }
}

/// A write that exhausted its replay attempts or could not be decoded.
/// The payload is kept as stored so a damaged row can still be listed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
  pub id: i64,
  pub payload: String,
  pub created_at: Option<DateTime<Utc>>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
  pub dead_at: DateTime<Utc>,
}

impl DeadLetter {
  /// The original request, if the payload still decodes.
  pub fn record(&self) -> Option<RequestRecord> {
    serde_json::from_str(&self.payload).ok()
  }
}

/// What happened to an item after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  /// Still at its position in the queue
  Retained { attempts: u32 },
  /// Moved out of the queue into the dead-letter table
  DeadLettered { attempts: u32 },
}

#[derive(Clone)]
pub struct WriteQueue {
  db: Database,
  max_attempts: u32,
}

impl WriteQueue {
  /// `max_attempts == 0` keeps failed items forever.
  pub fn new(db: Database, max_attempts: u32) -> Self {
    Self { db, max_attempts }
  }

  /// Append a write with a fresh id and zero attempts.
  pub fn enqueue(&self, payload: &RequestRecord) -> Result<QueueItem> {
    let conn = self.db.lock()?;
    let created_at = Utc::now();
    let json =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO write_queue (payload, created_at, attempt_count) VALUES (?, ?, 0)",
        params![json, format_datetime(&created_at)],
      )
      .map_err(|e| eyre!("Failed to enqueue write: {}", e))?;

    Ok(QueueItem {
      id: conn.last_insert_rowid(),
      payload: payload.clone(),
      created_at,
      attempt_count: 0,
      last_error: None,
    })
  }

  /// The oldest pending item.
  pub fn head(&self) -> Result<Option<QueueItem>> {
    self.head_raw()?.map(|raw| raw.decode()).transpose()
  }

  /// The oldest pending row, undecoded. Fails only if the database does.
  pub fn head_raw(&self) -> Result<Option<RawQueueItem>> {
    let conn = self.db.lock()?;

    conn
      .query_row(
        "SELECT id, payload, created_at, attempt_count, last_error FROM write_queue
         ORDER BY id LIMIT 1",
        [],
        raw_item,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))
  }

  /// All pending items in replay order.
  pub fn pending(&self) -> Result<Vec<QueueItem>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, payload, created_at, attempt_count, last_error FROM write_queue
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare queue listing: {}", e))?;

    let rows: Vec<RawQueueItem> = stmt
      .query_map([], raw_item)
      .map_err(|e| eyre!("Failed to list queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows.iter().map(RawQueueItem::decode).collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM write_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count.max(0) as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Drop an item after a successful replay.
  pub fn remove(&self, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM write_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued write {}: {}", id, e))?;
    Ok(())
  }

  /// Count a failed replay. The item keeps its position unless it has now
  /// used up `max_attempts`, in which case it moves to the dead letters.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<FailureOutcome> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE write_queue SET attempt_count = attempt_count + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )
    .map_err(|e| eyre!("Failed to record failure of {}: {}", id, e))?;

    let attempts: u32 = tx
      .query_row(
        "SELECT attempt_count FROM write_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Queued write {} disappeared: {}", id, e))?;

    let outcome = if self.max_attempts > 0 && attempts >= self.max_attempts {
      move_to_dead_letters(&tx, id)?;
      FailureOutcome::DeadLettered { attempts }
    } else {
      FailureOutcome::Retained { attempts }
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(outcome)
  }

  /// Move an item to the dead letters now, whatever its attempt count.
  /// Used for rows that can never be replayed.
  pub fn dead_letter(&self, id: i64, reason: &str) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE write_queue SET last_error = ? WHERE id = ?",
      params![reason, id],
    )
    .map_err(|e| eyre!("Failed to record failure of {}: {}", id, e))?;
    move_to_dead_letters(&tx, id)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, payload, created_at, attempt_count, last_error, dead_at FROM dead_letters
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare dead-letter listing: {}", e))?;

    let rows: Vec<(RawQueueItem, String)> = stmt
      .query_map([], |row| Ok((raw_item(row)?, row.get(5)?)))
      .map_err(|e| eyre!("Failed to list dead letters: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read dead-letter row: {}", e))?;

    rows
      .into_iter()
      .map(|(raw, dead_at)| {
        Ok(DeadLetter {
          id: raw.id,
          created_at: parse_datetime(&raw.created_at).ok(),
          payload: raw.payload,
          attempt_count: raw.attempt_count,
          last_error: raw.last_error,
          dead_at: parse_datetime(&dead_at)?,
        })
      })
      .collect()
  }
}

fn move_to_dead_letters(tx: &rusqlite::Transaction<'_>, id: i64) -> Result<()> {
  tx.execute(
    "INSERT INTO dead_letters (id, payload, created_at, attempt_count, last_error, dead_at)
     SELECT id, payload, created_at, attempt_count, last_error, ? FROM write_queue WHERE id = ?",
    params![format_datetime(&Utc::now()), id],
  )
  .map_err(|e| eyre!("Failed to dead-letter {}: {}", id, e))?;
  tx.execute("DELETE FROM write_queue WHERE id = ?", params![id])
    .map_err(|e| eyre!("Failed to remove dead-lettered {}: {}", id, e))?;
  Ok(())
}

fn raw_item(row: &Row<'_>) -> rusqlite::Result<RawQueueItem> {
  Ok(RawQueueItem {
    id: row.get(0)?,
    payload: row.get(1)?,
    created_at: row.get(2)?,
    attempt_count: row.get(3)?,
    last_error: row.get(4)?,
  })
}
