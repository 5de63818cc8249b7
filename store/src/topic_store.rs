//! `TopicStore`: topic→session mappings, per-topic stats, and the lifecycle event log
//! (spec.md §4.3, §6).

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::models::{now_ms, TopicEvent, TopicEventType, TopicMapping, TopicStats, TopicStatus};

pub struct TopicStore {
    db: Arc<Mutex<Connection>>,
}

impl TopicStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS topic_mappings (
                chat_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                topic_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                work_dir TEXT,
                streaming_enabled INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                closed_at INTEGER,
                creator_user_id INTEGER,
                icon_color INTEGER,
                icon_emoji_id TEXT,
                PRIMARY KEY (chat_id, topic_id)
            );
            CREATE INDEX IF NOT EXISTS idx_topic_mappings_session_id ON topic_mappings(session_id);
            CREATE INDEX IF NOT EXISTS idx_topic_mappings_status ON topic_mappings(status);

            CREATE TABLE IF NOT EXISTS topic_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                user_id INTEGER,
                metadata_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_topic_events_chat_topic ON topic_events(chat_id, topic_id);

            CREATE TABLE IF NOT EXISTS topic_stats (
                chat_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_message_at INTEGER,
                tool_calls INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, topic_id),
                FOREIGN KEY (chat_id, topic_id) REFERENCES topic_mappings(chat_id, topic_id)
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

    fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopicMapping> {
        let status_str: String = row.get("status")?;
        let status = TopicStatus::from_str(&status_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
        Ok(TopicMapping {
            chat_id: row.get("chat_id")?,
            topic_id: row.get("topic_id")?,
            topic_name: row.get("topic_name")?,
            session_id: row.get("session_id")?,
            work_dir: row.get("work_dir")?,
            streaming_enabled: row.get::<_, i64>("streaming_enabled")? != 0,
            status,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            closed_at: row.get("closed_at")?,
            creator_user_id: row.get("creator_user_id")?,
            icon_color: row.get("icon_color")?,
            icon_emoji_id: row.get("icon_emoji_id")?,
        })
    }

    /// Creates a mapping and its zeroed stats row. `(chat_id, topic_id)` is the primary key;
    /// a second call for the same pair is a conflict (spec.md §9: the explicit-creation path
    /// is authoritative, so callers must check `get_mapping` first before creating).
    pub fn create_mapping(&self, m: &TopicMapping) -> Result<()> {
        let m = m.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO topic_mappings
                    (chat_id, topic_id, topic_name, session_id, work_dir, streaming_enabled,
                     status, created_at, updated_at, closed_at, creator_user_id, icon_color, icon_emoji_id)
                VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                "#,
                params![
                    m.chat_id,
                    m.topic_id,
                    m.topic_name,
                    m.session_id,
                    m.work_dir,
                    m.streaming_enabled as i64,
                    m.status.as_str(),
                    m.created_at,
                    m.updated_at,
                    m.closed_at,
                    m.creator_user_id,
                    m.icon_color,
                    m.icon_emoji_id,
                ],
            )?;
            if n == 0 {
                return Err(StoreError::Conflict(format!(
                    "mapping already exists for chat {} topic {}",
                    m.chat_id, m.topic_id
                )));
            }
            conn.execute(
                "INSERT OR IGNORE INTO topic_stats (chat_id, topic_id) VALUES (?1,?2)",
                params![m.chat_id, m.topic_id],
            )?;
            Ok(())
        })
    }

    pub fn get_mapping(&self, chat_id: i64, topic_id: i64) -> Result<Option<TopicMapping>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM topic_mappings WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
                Self::row_to_mapping,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn get_by_session(&self, session_id: &str) -> Result<Option<TopicMapping>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM topic_mappings WHERE session_id = ?1",
                params![session_id],
                Self::row_to_mapping,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn list_active(&self) -> Result<Vec<TopicMapping>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM topic_mappings WHERE status = 'active'")?;
            let rows = stmt
                .query_map([], Self::row_to_mapping)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn update_status(&self, chat_id: i64, topic_id: i64, status: TopicStatus) -> Result<()> {
        let now = now_ms();
        self.with_conn(move |conn| {
            let closed_at = if status == TopicStatus::Closed { Some(now) } else { None };
            conn.execute(
                "UPDATE topic_mappings SET status = ?3, closed_at = COALESCE(?4, closed_at), updated_at = ?5
                 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, status.as_str(), closed_at, now],
            )?;
            Ok(())
        })
    }

    pub fn update_name(&self, chat_id: i64, topic_id: i64, name: &str) -> Result<()> {
        let name = name.to_string();
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_mappings SET topic_name = ?3, updated_at = ?4 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, name, now],
            )?;
            Ok(())
        })
    }

    pub fn update_work_dir(&self, chat_id: i64, topic_id: i64, work_dir: &str) -> Result<()> {
        let work_dir = work_dir.to_string();
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_mappings SET work_dir = ?3, updated_at = ?4 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, work_dir, now],
            )?;
            Ok(())
        })
    }

    pub fn update_streaming_enabled(&self, chat_id: i64, topic_id: i64, enabled: bool) -> Result<()> {
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_mappings SET streaming_enabled = ?3, updated_at = ?4 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, enabled as i64, now],
            )?;
            Ok(())
        })
    }

    /// Rebinds a placeholder sessionID to the real one discovered at `instance:ready`
    /// (spec.md §4.6, §9). The single writer for this is the `instance:ready` subscriber.
    pub fn update_session_id(&self, chat_id: i64, topic_id: i64, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_mappings SET session_id = ?3, updated_at = ?4 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, session_id, now],
            )?;
            Ok(())
        })
    }

    pub fn delete_mapping(&self, chat_id: i64, topic_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM topic_stats WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
            )?;
            conn.execute(
                "DELETE FROM topic_mappings WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
            )?;
            Ok(())
        })
    }

    pub fn record_message(&self, chat_id: i64, topic_id: i64) -> Result<()> {
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_stats SET message_count = message_count + 1, last_message_at = ?3
                 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id, now],
            )?;
            Ok(())
        })
    }

    pub fn record_tool_call(&self, chat_id: i64, topic_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_stats SET tool_calls = tool_calls + 1 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
            )?;
            Ok(())
        })
    }

    pub fn record_error(&self, chat_id: i64, topic_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE topic_stats SET error_count = error_count + 1 WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
            )?;
            Ok(())
        })
    }

    pub fn get_stats(&self, chat_id: i64, topic_id: i64) -> Result<Option<TopicStats>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT chat_id, topic_id, message_count, last_message_at, tool_calls, error_count
                 FROM topic_stats WHERE chat_id = ?1 AND topic_id = ?2",
                params![chat_id, topic_id],
                |row| {
                    Ok(TopicStats {
                        chat_id: row.get(0)?,
                        topic_id: row.get(1)?,
                        message_count: row.get(2)?,
                        last_message_at: row.get(3)?,
                        tool_calls: row.get(4)?,
                        error_count: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn append_event(
        &self,
        chat_id: i64,
        topic_id: i64,
        event_type: TopicEventType,
        user_id: Option<i64>,
        metadata_json: Option<String>,
    ) -> Result<i64> {
        let now = now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO topic_events (chat_id, topic_id, event_type, timestamp, user_id, metadata_json)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![chat_id, topic_id, event_type.as_str(), now, user_id, metadata_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_events(&self, chat_id: i64, topic_id: i64, limit: i64) -> Result<Vec<TopicEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, topic_id, event_type, timestamp, user_id, metadata_json
                 FROM topic_events WHERE chat_id = ?1 AND topic_id = ?2 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![chat_id, topic_id, limit], |row| {
                    let type_str: String = row.get(3)?;
                    let event_type = TopicEventType::from_str(&type_str).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                    })?;
                    Ok(TopicEvent {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        topic_id: row.get(2)?,
                        event_type,
                        timestamp: row.get(4)?,
                        user_id: row.get(5)?,
                        metadata_json: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Mappings whose last message (or, absent any message, creation) is older than
    /// `idle_ms` — used by a periodic sweep to close abandoned topics (spec.md §4.3).
    pub fn find_idle_since(&self, idle_ms: i64) -> Result<Vec<TopicMapping>> {
        let cutoff = now_ms() - idle_ms;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT m.* FROM topic_mappings m
                JOIN topic_stats s ON s.chat_id = m.chat_id AND s.topic_id = m.topic_id
                WHERE m.status = 'active'
                  AND COALESCE(s.last_message_at, m.updated_at) < ?1
                  AND m.updated_at < ?1
                "#,
            )?;
            let rows = stmt
                .query_map(params![cutoff], Self::row_to_mapping)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(chat_id: i64, topic_id: i64, session_id: &str) -> TopicMapping {
        let now = now_ms();
        TopicMapping {
            chat_id,
            topic_id,
            topic_name: "proj".into(),
            session_id: session_id.to_string(),
            work_dir: Some("/tmp/proj".into()),
            streaming_enabled: false,
            status: TopicStatus::Active,
            created_at: now,
            updated_at: now,
            closed_at: None,
            creator_user_id: Some(1),
            icon_color: None,
            icon_emoji_id: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "pending_abc")).unwrap();
        let got = store.get_mapping(1, 42).unwrap().unwrap();
        assert!(got.is_placeholder_session());
        assert_eq!(got.status, TopicStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_create_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "pending_abc")).unwrap();
        let err = store.create_mapping(&mapping(1, 42, "pending_xyz")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn session_id_rebinding_promotes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "pending_abc")).unwrap();
        store.update_session_id(1, 42, "sess-real-1").unwrap();
        let got = store.get_mapping(1, 42).unwrap().unwrap();
        assert!(!got.is_placeholder_session());
        assert_eq!(got.session_id, "sess-real-1");
    }

    #[tokio::test]
    async fn stats_increment() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "sess-1")).unwrap();
        store.record_message(1, 42).unwrap();
        store.record_message(1, 42).unwrap();
        store.record_tool_call(1, 42).unwrap();
        store.record_error(1, 42).unwrap();
        let stats = store.get_stats(1, 42).unwrap().unwrap();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.tool_calls, 1);
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_message_at.is_some());
    }

    #[tokio::test]
    async fn events_append_and_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "sess-1")).unwrap();
        store.append_event(1, 42, TopicEventType::Created, Some(7), None).unwrap();
        store.append_event(1, 42, TopicEventType::Message, Some(7), None).unwrap();
        let events = store.list_events(1, 42, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, TopicEventType::Message);
        assert_eq!(events[1].event_type, TopicEventType::Created);
    }

    #[tokio::test]
    async fn find_idle_since_respects_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "sess-1")).unwrap();
        // Freshly created: not idle past a huge window.
        assert!(store.find_idle_since(24 * 3_600_000).unwrap().is_empty());
        // Past a zero window, everything looks idle.
        assert_eq!(store.find_idle_since(0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_mapping_removes_stats_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopicStore::new(dir.path().join("topics.db")).unwrap();
        store.create_mapping(&mapping(1, 42, "sess-1")).unwrap();
        store.delete_mapping(1, 42).unwrap();
        assert!(store.get_mapping(1, 42).unwrap().is_none());
        assert!(store.get_stats(1, 42).unwrap().is_none());
    }
}
