use crate::error::{Error, Result};
use crate::storage::Storage;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SQLite-backed storage. One flat `pairs` table holds every location's
/// key/value pairs plus a last-updated timestamp per pair.
#[derive(Clone)]
pub struct SqliteStorage {
    db_path: Arc<PathBuf>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self> {
        let db_path = PathBuf::from(path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }

        let conn = Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS pairs (
                loc TEXT NOT NULL,
                id TEXT NOT NULL,
                val TEXT NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (loc, id)
            );
            CREATE INDEX IF NOT EXISTS idx_pairs_loc ON pairs(loc);
            ",
        )
        .map_err(storage_err)?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&*self.db_path).map_err(storage_err)
    }
}

impl Storage for SqliteStorage {
    fn load(&self, loc: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, val FROM pairs WHERE loc = ?1 ORDER BY id ASC")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![loc], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row.map_err(storage_err)?);
        }
        Ok(pairs)
    }

    fn add(&self, loc: &str, id: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO pairs (loc, id, val, updated) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (loc, id) DO UPDATE SET val = ?3, updated = ?4",
                params![loc, id, value, Utc::now().to_rfc3339()],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn remove(&self, loc: &str, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM pairs WHERE loc = ?1 AND id = ?2", params![loc, id])
            .map_err(storage_err)?;
        Ok(())
    }

    fn clear(&self, loc: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM pairs WHERE loc = ?1", params![loc])
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete(&self, loc: &str) -> Result<()> {
        self.clear(loc)
    }

    fn health(&self) -> Result<()> {
        self.conn()?
            .query_row("SELECT 1", [], |_row| Ok(()))
            .map_err(storage_err)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        format!("/tmp/sift-tests/{name}-{nanos}.db")
    }

    #[test]
    fn add_load_roundtrip() {
        let store = SqliteStorage::open(&db_path("roundtrip")).expect("open");
        store.add("here", "f1", "{\"likes\":\"tacos\"}").expect("add");
        store.add("here", "f2", "{\"likes\":\"beer\"}").expect("add");

        let pairs = store.load("here").expect("load");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("f1".to_string(), "{\"likes\":\"tacos\"}".to_string()));
    }

    #[test]
    fn upsert_overwrites_same_id() {
        let store = SqliteStorage::open(&db_path("upsert")).expect("open");
        store.add("here", "f1", "old").expect("add");
        store.add("here", "f1", "new").expect("add");
        let pairs = store.load("here").expect("load");
        assert_eq!(pairs, vec![("f1".to_string(), "new".to_string())]);
    }

    #[test]
    fn clear_only_touches_one_location() {
        let store = SqliteStorage::open(&db_path("clear")).expect("open");
        store.add("a", "f1", "x").expect("add");
        store.add("b", "f1", "y").expect("add");
        store.clear("a").expect("clear");
        assert!(store.load("a").expect("load").is_empty());
        assert_eq!(store.load("b").expect("load").len(), 1);
    }

    #[test]
    fn health_checks_the_database() {
        let store = SqliteStorage::open(&db_path("health")).expect("open");
        store.health().expect("healthy");
    }
}
