//! Durable key/value storage, the worker's stand-in for browser local storage.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::Database;

#[derive(Clone)]
pub struct LocalStorage {
  db: Database,
}

impl LocalStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn get(&self, key: &str) -> Result<Option<String>> {
    read(&*self.db.lock()?, key)
  }

  pub fn set(&self, key: &str, value: &str) -> Result<()> {
    write(&*self.db.lock()?, key, value)
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    Locked(&*self.db.lock()?).remove(key)
  }

  /// Read and decode a JSON value. Undecodable values read as missing.
  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    Locked(&*self.db.lock()?).get_json(key)
  }

  pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    Locked(&*self.db.lock()?).set_json(key, value)
  }

  /// Read-modify-write a JSON value under a single lock. Missing or
  /// undecodable values start from `T::default()`.
  pub fn update_json<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Result<R>
  where
    T: Serialize + DeserializeOwned + Default,
  {
    Locked(&*self.db.lock()?).update_json(key, f)
  }

  /// Run several reads and writes with no other storage access in between.
  pub fn locked<R>(&self, f: impl FnOnce(&Locked<'_>) -> Result<R>) -> Result<R> {
    let conn = self.db.lock()?;
    f(&Locked(&conn))
  }
}

/// Storage view held under the database lock.
pub struct Locked<'a>(&'a Connection);

impl Locked<'_> {
  pub fn remove(&self, key: &str) -> Result<()> {
    self
      .0
      .execute("DELETE FROM local_storage WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }

  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    Ok(read(self.0, key)?.and_then(|raw| serde_json::from_str(&raw).ok()))
  }

  pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let raw =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    write(self.0, key, &raw)
  }

  pub fn update_json<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Result<R>
  where
    T: Serialize + DeserializeOwned + Default,
  {
    let mut value: T = self.get_json(key)?.unwrap_or_default();
    let result = f(&mut value);
    self.set_json(key, &value)?;
    Ok(result)
  }
}

fn read(conn: &Connection, key: &str) -> Result<Option<String>> {
  conn
    .query_row(
      "SELECT value FROM local_storage WHERE key = ?",
      params![key],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {}: {}", key, e))
}

fn write(conn: &Connection, key: &str, value: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO local_storage (key, value) VALUES (?, ?)",
      params![key, value],
    )
    .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_remove() {
    let storage = LocalStorage::new(Database::open_in_memory().unwrap());
    assert_eq!(storage.get("k").unwrap(), None);

    storage.set("k", "v").unwrap();
    storage.set("k", "w").unwrap();
    assert_eq!(storage.get("k").unwrap().as_deref(), Some("w"));

    storage.remove("k").unwrap();
    assert_eq!(storage.get("k").unwrap(), None);
  }

  #[test]
  fn test_update_json_starts_from_default() {
    let storage = LocalStorage::new(Database::open_in_memory().unwrap());

    let len = storage
      .update_json("list", |v: &mut Vec<u32>| {
        v.push(7);
        v.len()
      })
      .unwrap();
    assert_eq!(len, 1);

    storage.update_json("list", |v: &mut Vec<u32>| v.push(8)).unwrap();
    assert_eq!(storage.get_json::<Vec<u32>>("list").unwrap(), Some(vec![7, 8]));
  }

  #[test]
  fn test_corrupt_json_reads_as_missing() {
    let storage = LocalStorage::new(Database::open_in_memory().unwrap());
    storage.set("prefs", "{not json").unwrap();

    let value: Option<Vec<u32>> = storage.get_json("prefs").unwrap();
    assert_eq!(value, None);
  }

  #[test]
  fn test_locked_sees_its_own_writes() {
    let storage = LocalStorage::new(Database::open_in_memory().unwrap());

    let seen = storage
      .locked(|s| {
        s.set_json("flag", &true)?;
        s.update_json("count", |n: &mut u32| *n += 1)?;
        s.get_json::<bool>("flag")
      })
      .unwrap();

    assert_eq!(seen, Some(true));
    assert_eq!(storage.get_json::<u32>("count").unwrap(), Some(1));
  }
}
