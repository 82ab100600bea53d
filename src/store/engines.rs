//! Concrete key/value engines the store worker can drive.
//!
//! Every engine keeps keys ordered so iteration follows the zero-padded
//! sequence prefix of cache keys.

use std::{collections::BTreeMap, fs, path::PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::error;
use rusqlite::{params, Connection};

use super::migrations::run_migrations;
use crate::settings::StorageDriver;

pub trait KeyValueStore: Send {
    fn driver(&self) -> StorageDriver;

    /// All entries in ascending key order.
    fn entries(&mut self) -> Result<Vec<(String, String)>>;

    fn set_item(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&mut self, key: &str) -> Result<()>;

    fn clear(&mut self) -> Result<()>;
}

pub struct SqliteStore {
    conn: Connection,
    store_name: String,
}

impl SqliteStore {
    pub fn open(path: PathBuf, store_name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open SQLite cache {}", path.display()))?;
        Self::with_connection(conn, store_name)
    }

    pub fn with_connection(mut conn: Connection, store_name: &str) -> Result<Self> {
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }
        run_migrations(&mut conn).context("failed to run cache migrations")?;

        Ok(Self {
            conn,
            store_name: store_name.to_string(),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Sqlite
    }

    fn entries(&mut self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM cache_entries
             WHERE store_name = ?1
             ORDER BY key ASC",
        )?;

        let mut rows = stmt.query(params![self.store_name])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        }
        Ok(entries)
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cache_entries (store_name, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(store_name, key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![self.store_name, key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to upsert cache entry {key}"))?;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM cache_entries WHERE store_name = ?1 AND key = ?2",
                params![self.store_name, key],
            )
            .with_context(|| format!("failed to delete cache entry {key}"))?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM cache_entries WHERE store_name = ?1",
                params![self.store_name],
            )
            .context("failed to clear cache entries")?;
        Ok(())
    }
}

/// Whole-map JSON file, rewritten after every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache directory {}", parent.display())
            })?;
        }

        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read cache file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("corrupt cache file {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        let store = Self { path, entries };
        store.persist()?;
        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string(&self.entries)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write cache file {}", self.path.display()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Json
    }

    fn entries(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn remove_item(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Memory
    }

    fn entries(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &mut dyn KeyValueStore) {
        store.set_item("002_s_Click", "b").unwrap();
        store.set_item("001_s_Init", "a").unwrap();
        store.set_item("002_s_Click", "b2").unwrap();

        assert_eq!(
            store.entries().unwrap(),
            vec![
                ("001_s_Init".to_string(), "a".to_string()),
                ("002_s_Click".to_string(), "b2".to_string()),
            ]
        );

        store.remove_item("001_s_Init").unwrap();
        store.remove_item("missing").unwrap();
        assert_eq!(store.entries().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn memory_store_behaves_as_ordered_map() {
        exercise(&mut MemoryStore::default());
    }

    #[test]
    fn sqlite_store_upserts_and_scopes_by_store_name() {
        let conn = Connection::open_in_memory().unwrap();
        let mut store = SqliteStore::with_connection(conn, "chain").unwrap();
        exercise(&mut store);

        store.set_item("001_s_Init", "a").unwrap();
        store
            .conn
            .execute(
                "INSERT INTO cache_entries (store_name, key, value, updated_at)
                 VALUES ('other', 'k', 'v', 'now')",
                [],
            )
            .unwrap();
        store.clear().unwrap();

        let remaining: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut store = JsonFileStore::open(path.clone()).unwrap();
        exercise(&mut store);
        store.set_item("003_s_Jump", "c").unwrap();
        drop(store);

        let mut reopened = JsonFileStore::open(path).unwrap();
        assert_eq!(
            reopened.entries().unwrap(),
            vec![("003_s_Jump".to_string(), "c".to_string())]
        );
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFileStore::open(path).is_err());
    }
}
