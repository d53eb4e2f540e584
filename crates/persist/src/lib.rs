//! Sekret preference store: a minimal SQLite key/value table for the last
//! selected context, namespace, and name. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing::debug;

/// Key/value persistence surface for selection preferences. Read at
/// startup, written only after a selection change has taken effect.
pub trait PrefStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed store. Simple, synchronous; selection writes are rare.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SEKRET_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS prefs (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("creating prefs table")?;
        debug!(path = %path, "preference store opened");
        Ok(Self { db: std::sync::Mutex::new(db) })
    }
}

impl PrefStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT value FROM prefs WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO prefs(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".sekret");
        let _ = std::fs::create_dir_all(&p);
        p.push("sekret.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "sekret.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "sekret-test-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        assert_eq!(s.get("last-selected-context").unwrap(), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.set("last-selected-namespace", "team-a").unwrap();
        assert_eq!(
            s.get("last-selected-namespace").unwrap().as_deref(),
            Some("team-a")
        );
    }

    #[test]
    fn set_overwrites_previous_value() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.set("last-selected-name", "old").unwrap();
        s.set("last-selected-name", "new").unwrap();
        assert_eq!(s.get("last-selected-name").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn values_survive_reopen() {
        let path = temp_db();
        {
            let s = SqliteStore::open(&path).unwrap();
            s.set("last-selected-context", "staging").unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        assert_eq!(
            s.get("last-selected-context").unwrap().as_deref(),
            Some("staging")
        );
    }
}
