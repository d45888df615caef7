// Persistent key-value storage for session tokens

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// Synchronous string key-value store holding the session tokens
///
/// The manager serializes all access behind its own lock, so
/// implementations only need to be `Send`.
pub trait TokenStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;

    /// Write several entries; implementations should make this atomic
    fn set_many(&mut self, entries: &[(&str, &str)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Remove several keys; implementations should make this atomic
    fn remove_many(&mut self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}

/// SQLite-backed store using a single `auth_kv` table
pub struct SqliteTokenStore {
    conn: Connection,
}

impl SqliteTokenStore {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;
        Ok(Self { conn })
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to read '{}' from SQLite", key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.remove_many(&[key])
    }

    fn set_many(&mut self, entries: &[(&str, &str)]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin SQLite transaction")?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("Failed to write '{}' to SQLite", key))?;
        }
        tx.commit().context("Failed to commit token write")
    }

    fn remove_many(&mut self, keys: &[&str]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin SQLite transaction")?;
        for key in keys {
            tx.execute("DELETE FROM auth_kv WHERE key = ?", [key])
                .with_context(|| format!("Failed to remove '{}' from SQLite", key))?;
        }
        tx.commit().context("Failed to commit token removal")
    }
}

/// Process-local store; nothing survives a restart
#[derive(Debug, Default, Clone)]
pub struct MemoryTokenStore {
    entries: HashMap<String, String>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &mut dyn TokenStore) {
        assert_eq!(store.get("accessToken").unwrap(), None);

        store.set("accessToken", "a1").unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("a1"));

        // Overwrite keeps a single value
        store.set("accessToken", "a2").unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("a2"));

        store
            .set_many(&[("refreshToken", "r1"), ("token", "legacy")])
            .unwrap();
        assert_eq!(store.get("refreshToken").unwrap().as_deref(), Some("r1"));

        store
            .remove_many(&["accessToken", "refreshToken", "token"])
            .unwrap();
        assert_eq!(store.get("accessToken").unwrap(), None);
        assert_eq!(store.get("refreshToken").unwrap(), None);
        assert_eq!(store.get("token").unwrap(), None);

        // Removing a missing key is not an error
        store.remove("accessToken").unwrap();
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryTokenStore::new();
        exercise_store(&mut store);
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        let mut store = SqliteTokenStore::open_in_memory().unwrap();
        exercise_store(&mut store);
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.sqlite3");

        {
            let mut store = SqliteTokenStore::open(&path).unwrap();
            store
                .set_many(&[("accessToken", "a1"), ("refreshToken", "r1")])
                .unwrap();
        }

        let store = SqliteTokenStore::open(&path).unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("a1"));
        assert_eq!(store.get("refreshToken").unwrap().as_deref(), Some("r1"));
    }
}
