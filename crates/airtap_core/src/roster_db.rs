/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::registry::PeerRecord;
use airtap_protocol::AccountId;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable roster storage. Speaking state is transient, so stores may ignore it.
pub trait RosterStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<PeerRecord>>;
    fn insert(&self, record: &PeerRecord) -> Result<()>;
    fn delete(&self, id: AccountId) -> Result<()>;
    fn wipe_all(&self) -> Result<()>;
    fn set_muted(&self, id: AccountId, muted: bool) -> Result<()>;
    fn set_speaking(&self, _id: AccountId, _speaking: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct RosterDb {
    path: PathBuf,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl RosterDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS peers (
              id INTEGER PRIMARY KEY,
              first_name TEXT NOT NULL,
              last_name TEXT NULL,
              is_muted INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peers_created ON peers(created_at_ms ASC);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).with_context(|| format!("open db: {}", self.path.display()))
    }
}

impl RosterStore for RosterDb {
    fn load_all(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, is_muted FROM peers ORDER BY created_at_ms ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(PeerRecord {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                is_muted: r.get::<_, i64>(3)? != 0,
                is_speaking: false,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn insert(&self, record: &PeerRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO peers (id, first_name, last_name, is_muted, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.first_name,
                record.last_name,
                record.is_muted as i64,
                now_ms()
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: AccountId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn wipe_all(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM peers", [])?;
        Ok(())
    }

    fn set_muted(&self, id: AccountId, muted: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE peers SET is_muted = ?2 WHERE id = ?1",
            params![id, muted as i64],
        )?;
        Ok(())
    }
}

/// Roster kept in memory only. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryRoster {
    rows: Arc<Mutex<Vec<PeerRecord>>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<PeerRecord>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(peers)),
        }
    }

    pub fn rows(&self) -> Vec<PeerRecord> {
        self.rows.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn with_rows<T>(&self, f: impl FnOnce(&mut Vec<PeerRecord>) -> T) -> Result<T> {
        let mut g = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("roster lock poisoned"))?;
        Ok(f(&mut g))
    }
}

impl RosterStore for MemoryRoster {
    fn load_all(&self) -> Result<Vec<PeerRecord>> {
        self.with_rows(|rows| rows.clone())
    }

    fn insert(&self, record: &PeerRecord) -> Result<()> {
        self.with_rows(|rows| {
            if !rows.iter().any(|r| r.id == record.id) {
                rows.push(record.clone());
            }
        })
    }

    fn delete(&self, id: AccountId) -> Result<()> {
        self.with_rows(|rows| rows.retain(|r| r.id != id))
    }

    fn wipe_all(&self) -> Result<()> {
        self.with_rows(|rows| rows.clear())
    }

    fn set_muted(&self, id: AccountId, muted: bool) -> Result<()> {
        self.with_rows(|rows| {
            if let Some(r) = rows.iter_mut().find(|r| r.id == id) {
                r.is_muted = muted;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: AccountId, name: &str) -> PeerRecord {
        PeerRecord::new(id, name, None)
    }

    #[test]
    fn rows_survive_reopen_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.db");
        {
            let db = RosterDb::open(&path).unwrap();
            db.insert(&peer(42, "Ana")).unwrap();
            db.insert(&PeerRecord::new(9, "Bo", Some("Lind".to_string()))).unwrap();
            db.insert(&peer(42, "Duplicate")).unwrap();
            db.set_muted(9, true).unwrap();
        }
        let db = RosterDb::open(&path).unwrap();
        let rows = db.load_all().unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![42, 9]);
        assert_eq!(rows[0].first_name, "Ana");
        assert_eq!(rows[1].last_name.as_deref(), Some("Lind"));
        assert!(rows[1].is_muted);
        assert!(!rows[1].is_speaking);
    }

    #[test]
    fn delete_and_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let db = RosterDb::open(dir.path().join("nested").join("roster.db")).unwrap();
        db.insert(&peer(1, "A")).unwrap();
        db.insert(&peer(2, "B")).unwrap();
        db.delete(1).unwrap();
        db.delete(1).unwrap();
        assert_eq!(db.load_all().unwrap().len(), 1);
        db.wipe_all().unwrap();
        assert!(db.load_all().unwrap().is_empty());
    }
}
