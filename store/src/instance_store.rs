//! Orchestrator `StateStore`: instance records and port allocations (spec.md §4.3, §6).
//!
//! Durable record of instance configurations, ports, PIDs and last-known state. Accessed
//! from the orchestrator's single control task; writes for a given instance are naturally
//! serialized by that task, so the connection itself only needs a `Mutex` to satisfy `Sync`.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::models::{now_ms, InstanceRecord, InstanceState, PortAllocation};

pub struct InstanceStore {
    db: Arc<Mutex<Connection>>,
}

impl InstanceStore {
    /// Opens or creates the database, enabling WAL mode, and ensures both tables exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                topic_id INTEGER NOT NULL,
                port INTEGER NOT NULL,
                work_dir TEXT NOT NULL,
                name TEXT,
                session_id TEXT,
                state TEXT NOT NULL,
                pid INTEGER,
                started_at INTEGER,
                last_activity_at INTEGER,
                restart_count INTEGER NOT NULL DEFAULT 0,
                env_json TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_topic_id ON instances(topic_id);
            CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);

            CREATE TABLE IF NOT EXISTS port_allocations (
                port INTEGER PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instances(instance_id),
                allocated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T> + Send) -> Result<T>
    where
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("poisoned lock".into()))?;
            f(&conn)
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
        let state_str: String = row.get("state")?;
        let state = InstanceState::from_str(&state_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
        let port: i64 = row.get("port")?;
        Ok(InstanceRecord {
            instance_id: row.get("instance_id")?,
            topic_id: row.get("topic_id")?,
            port: port as u16,
            work_dir: row.get("work_dir")?,
            name: row.get("name")?,
            session_id: row.get("session_id")?,
            state,
            pid: row.get("pid")?,
            started_at: row.get("started_at")?,
            last_activity_at: row.get("last_activity_at")?,
            restart_count: row.get("restart_count")?,
            env_json: row.get("env_json")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Inserts a new record or overwrites an existing one keyed by `instance_id`.
    pub fn upsert(&self, rec: &InstanceRecord) -> Result<()> {
        let rec = rec.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO instances
                    (instance_id, topic_id, port, work_dir, name, session_id, state, pid,
                     started_at, last_activity_at, restart_count, env_json, created_at, updated_at)
                VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                ON CONFLICT(instance_id) DO UPDATE SET
                    topic_id=excluded.topic_id, port=excluded.port, work_dir=excluded.work_dir,
                    name=excluded.name, session_id=excluded.session_id, state=excluded.state,
                    pid=excluded.pid, started_at=excluded.started_at,
                    last_activity_at=excluded.last_activity_at, restart_count=excluded.restart_count,
                    env_json=excluded.env_json, updated_at=excluded.updated_at
                "#,
                params![
                    rec.instance_id,
                    rec.topic_id,
                    rec.port as i64,
                    rec.work_dir,
                    rec.name,
                    rec.session_id,
                    rec.state.as_str(),
                    rec.pid,
                    rec.started_at,
                    rec.last_activity_at,
                    rec.restart_count,
                    rec.env_json,
                    rec.created_at,
                    rec.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM instances WHERE instance_id = ?1",
                params![instance_id],
                Self::row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn get_by_topic(&self, topic_id: i64) -> Result<Option<InstanceRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM instances WHERE topic_id = ?1",
                params![topic_id],
                Self::row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn list_by_state(&self, state: InstanceState) -> Result<Vec<InstanceRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM instances WHERE state = ?1")?;
            let rows = stmt
                .query_map(params![state.as_str()], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn list_all(&self) -> Result<Vec<InstanceRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM instances")?;
            let rows = stmt
                .query_map([], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn increment_restart_count(&self, instance_id: &str) -> Result<i64> {
        let instance_id = instance_id.to_string();
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE instances SET restart_count = restart_count + 1, updated_at = ?2 WHERE instance_id = ?1",
                params![instance_id, now],
            )?;
            let count: i64 = conn.query_row(
                "SELECT restart_count FROM instances WHERE instance_id = ?1",
                params![instance_id],
                |r| r.get(0),
            )?;
            Ok(count)
        })
    }

    /// Startup recovery step: any record in `{running, starting, stopping}` is stale (the
    /// process that owned it died with the supervisor). Marks them `crashed` and returns how
    /// many were changed.
    pub fn mark_stale_as_crashed(&self) -> Result<usize> {
        let now = now_ms();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE instances SET state = 'crashed', updated_at = ?1
                 WHERE state IN ('running', 'starting', 'stopping')",
                params![now],
            )?;
            Ok(n)
        })
    }

    pub fn delete(&self, instance_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM port_allocations WHERE instance_id = ?1", params![instance_id])?;
            conn.execute("DELETE FROM instances WHERE instance_id = ?1", params![instance_id])?;
            Ok(())
        })
    }

    pub fn insert_port_allocation(&self, alloc: &PortAllocation) -> Result<()> {
        let alloc = alloc.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO port_allocations (port, instance_id, allocated_at) VALUES (?1,?2,?3)",
                params![alloc.port as i64, alloc.instance_id, alloc.allocated_at],
            )?;
            Ok(())
        })
    }

    pub fn delete_port_allocation(&self, port: u16) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM port_allocations WHERE port = ?1", params![port as i64])?;
            Ok(())
        })
    }

    pub fn delete_port_allocation_by_instance(&self, instance_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM port_allocations WHERE instance_id = ?1", params![instance_id])?;
            Ok(())
        })
    }

    pub fn list_port_allocations(&self) -> Result<Vec<PortAllocation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT port, instance_id, allocated_at FROM port_allocations")?;
            let rows = stmt
                .query_map([], |row| {
                    let port: i64 = row.get(0)?;
                    Ok(PortAllocation {
                        port: port as u16,
                        instance_id: row.get(1)?,
                        allocated_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceState;

    fn rec(id: &str, topic: i64, state: InstanceState) -> InstanceRecord {
        let now = now_ms();
        InstanceRecord {
            instance_id: id.to_string(),
            topic_id: topic,
            port: 4100,
            work_dir: "/tmp/proj".to_string(),
            name: None,
            session_id: None,
            state,
            pid: Some(123),
            started_at: Some(now),
            last_activity_at: Some(now),
            restart_count: 0,
            env_json: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("topic-1", 1, InstanceState::Starting)).unwrap();
        let got = store.get("topic-1").unwrap().unwrap();
        assert_eq!(got.state, InstanceState::Starting);
        assert_eq!(got.topic_id, 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_by_instance_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("topic-1", 1, InstanceState::Starting)).unwrap();
        let mut r2 = rec("topic-1", 1, InstanceState::Running);
        r2.session_id = Some("sess-1".into());
        store.upsert(&r2).unwrap();
        let got = store.get("topic-1").unwrap().unwrap();
        assert_eq!(got.state, InstanceState::Running);
        assert_eq!(got.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn mark_stale_as_crashed_only_touches_live_states() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("a", 1, InstanceState::Running)).unwrap();
        store.upsert(&rec("b", 2, InstanceState::Stopped)).unwrap();
        store.upsert(&rec("c", 3, InstanceState::Starting)).unwrap();

        let n = store.mark_stale_as_crashed().unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.get("a").unwrap().unwrap().state, InstanceState::Crashed);
        assert_eq!(store.get("b").unwrap().unwrap().state, InstanceState::Stopped);
        assert_eq!(store.get("c").unwrap().unwrap().state, InstanceState::Crashed);
    }

    #[tokio::test]
    async fn restart_count_increments() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("a", 1, InstanceState::Crashed)).unwrap();
        assert_eq!(store.increment_restart_count("a").unwrap(), 1);
        assert_eq!(store.increment_restart_count("a").unwrap(), 2);
    }

    #[tokio::test]
    async fn port_allocations_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("a", 1, InstanceState::Running)).unwrap();
        store
            .insert_port_allocation(&PortAllocation {
                port: 4100,
                instance_id: "a".into(),
                allocated_at: now_ms(),
            })
            .unwrap();
        assert_eq!(store.list_port_allocations().unwrap().len(), 1);
        store.delete_port_allocation_by_instance("a").unwrap();
        assert!(store.list_port_allocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_instance_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("state.db")).unwrap();
        store.upsert(&rec("a", 1, InstanceState::Stopped)).unwrap();
        store
            .insert_port_allocation(&PortAllocation {
                port: 4100,
                instance_id: "a".into(),
                allocated_at: now_ms(),
            })
            .unwrap();
        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.list_port_allocations().unwrap().is_empty());
    }
}
