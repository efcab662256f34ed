//! SQLite implementation of the cache store.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::traits::{CacheStore, CachedResponse, EntryInfo};
use crate::db::Database;
use crate::http::{Request, Response};

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

/// Stable, fixed-length primary key for a normalized request key.
fn entry_hash(request_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request_key.as_bytes());
  hex::encode(hasher.finalize())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
  // Fixed width so lexical order matches chronological order
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

impl CacheStore for SqliteStorage {
  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn open(&self, name: &str) -> Result<()> {
    let conn = self.db.lock()?;

    conn
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.db.lock()?;

    let found: Option<i64> = conn
      .query_row("SELECT 1 FROM caches WHERE name = ?", params![name], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::GET {
      return Ok(None);
    }

    let conn = self.db.lock()?;
    let hash = entry_hash(&request.cache_key());

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND entry_hash = ?",
        params![name, hash],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request.url, name, e))?;

    match row {
      Some((status, status_text, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

        Ok(Some(CachedResponse {
          cache_name: name.to_string(),
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          cached_at: parse_timestamp(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    if request.method != Method::GET {
      debug!(method = %request.method, url = %request.url, "Refusing to cache non-GET request");
      return Ok(());
    }

    let request_key = request.cache_key();
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, entry_hash, request_key, status, status_text, headers, body, size, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        name,
        entry_hash(&request_key),
        request_key,
        response.status,
        response.status_text,
        headers,
        response.body,
        response.size() as i64,
        format_timestamp(Utc::now()),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, name: &str, request_key: &str) -> Result<bool> {
    let conn = self.db.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND entry_hash = ?",
        params![name, entry_hash(request_key)],
      )
      .map_err(|e| eyre!("Failed to delete entry from {}: {}", name, e))?;

    Ok(removed > 0)
  }

  fn entry_size(&self, name: &str, request: &Request) -> Result<Option<u64>> {
    let conn = self.db.lock()?;

    let size: Option<i64> = conn
      .query_row(
        "SELECT size FROM cache_entries WHERE cache_name = ? AND entry_hash = ?",
        params![name, entry_hash(&request.cache_key())],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry size in {}: {}", name, e))?;

    Ok(size.map(|s| s.max(0) as u64))
  }

  fn total_size(&self, name: &str) -> Result<u64> {
    let conn = self.db.lock()?;

    let total: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(size), 0) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to compute size of {}: {}", name, e))?;

    Ok(total.max(0) as u64)
  }

  fn entries_by_age(&self, name: &str) -> Result<Vec<EntryInfo>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT request_key, size, cached_at FROM cache_entries
         WHERE cache_name = ?
         ORDER BY cached_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(request_key, size, cached_at)| {
        Ok(EntryInfo {
          request_key,
          size: size.max(0) as u64,
          cached_at: parse_timestamp(&cached_at)?,
        })
      })
      .collect()
  }
}
