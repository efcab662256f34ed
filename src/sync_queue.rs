//! Durable queue of writes made while offline.
//!
//! Items are created when the page asks the worker to defer a write, replayed
//! on the next background sync, and deleted only once the replay succeeds.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Database;

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
  pub id: String,
  /// Endpoint the data is POSTed to, relative to the origin or absolute
  pub endpoint: String,
  pub data: Value,
  pub created_at: DateTime<Utc>,
}

/// SQLite-backed sync queue.
#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
}

impl SyncQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Add an item. A missing id gets a fresh UUID; an existing id is replaced.
  pub fn enqueue(&self, id: Option<String>, endpoint: &str, data: Value) -> Result<SyncItem> {
    let item = SyncItem {
      id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
      endpoint: endpoint.to_string(),
      data,
      // Stored with microsecond precision
      created_at: Utc::now().trunc_subsecs(6),
    };

    let data = serde_json::to_string(&item.data)
      .map_err(|e| eyre!("Failed to serialize sync data: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO sync_queue (id, endpoint, data, created_at) VALUES (?, ?, ?, ?)",
        params![
          item.id,
          item.endpoint,
          data,
          item.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue sync item: {}", e))?;

    Ok(item)
  }

  /// All queued items, oldest first.
  pub fn items(&self) -> Result<Vec<SyncItem>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT id, endpoint, data, created_at FROM sync_queue ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync item: {}", e))?;

    rows
      .into_iter()
      .map(|(id, endpoint, data, created_at)| {
        Ok(SyncItem {
          data: serde_json::from_str(&data)
            .map_err(|e| eyre!("Failed to parse sync item {}: {}", id, e))?,
          created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| eyre!("Failed to parse sync item {} timestamp: {}", id, e))?,
          id,
          endpoint,
        })
      })
      .collect()
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.db.lock()?;

    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync item {}: {}", id, e))?;

    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count sync items: {}", e))?;

    Ok(count.max(0) as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> SyncQueue {
    SyncQueue::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_enqueue_assigns_id() {
    let queue = queue();
    let item = queue
      .enqueue(None, "/api/guestbook", json!({"name": "Ana"}))
      .unwrap();

    assert!(!item.id.is_empty());
    assert_eq!(queue.items().unwrap(), vec![item]);
  }

  #[test]
  fn test_items_keep_insertion_order() {
    let queue = queue();
    queue.enqueue(Some("a".into()), "/api/rsvp", json!(1)).unwrap();
    queue.enqueue(Some("b".into()), "/api/rsvp", json!(2)).unwrap();
    queue.enqueue(Some("c".into()), "/api/rsvp", json!(3)).unwrap();

    let ids: Vec<String> = queue.items().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_remove() {
    let queue = queue();
    queue.enqueue(Some("a".into()), "/api/rsvp", json!({})).unwrap();

    assert!(queue.remove("a").unwrap());
    assert!(!queue.remove("a").unwrap());
    assert_eq!(queue.len().unwrap(), 0);
  }

  #[test]
  fn test_same_id_replaces() {
    let queue = queue();
    queue.enqueue(Some("a".into()), "/api/rsvp", json!({"v": 1})).unwrap();
    queue.enqueue(Some("a".into()), "/api/rsvp", json!({"v": 2})).unwrap();

    let items = queue.items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].data, json!({"v": 2}));
  }
}
