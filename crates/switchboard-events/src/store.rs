// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Event store interface and the SQLite implementation.
//!
//! The store backs the publisher's optional exactly-once mode: events are
//! appended (which assigns the per-aggregate sequence number) before
//! fan-out and marked processed once every transport has accepted them.
//! The stream query feeds catch-up consumers.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::EVENT_SCHEMA_VERSION;

/// One persisted event row.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: AuditEvent,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Persistence contract the publisher and DLQ consume.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event, assigning the next sequence number for its
    /// aggregate. Appending a duplicate event id is an error.
    async fn append(&self, event: &AuditEvent) -> Result<u64>;

    /// Events with `created_at > since`, ascending, at most `batch_size`.
    async fn stream(&self, since: DateTime<Utc>, batch_size: usize) -> Result<Vec<StoredEvent>>;

    /// Record that every transport accepted the event.
    async fn mark_processed(&self, event_id: Uuid) -> Result<()>;
}

/// SQLite-backed event store.
///
/// The connection sits behind an async mutex; statements are short enough
/// that blocking the executor is not a concern at audit-event rates.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    event_version INTEGER NOT NULL,
    aggregate_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    event_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    processed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_events_aggregate ON audit_events(aggregate_id);
CREATE INDEX IF NOT EXISTS idx_audit_events_type ON audit_events(event_type);
CREATE INDEX IF NOT EXISTS idx_audit_events_created ON audit_events(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_events_aggregate_seq
    ON audit_events(aggregate_id, sequence_number);
";

impl SqliteEventStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn timestamp(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &AuditEvent) -> Result<u64> {
        let payload = serde_json::to_string(event)?;
        let created_at = Self::timestamp(Utc::now());
        let conn = self.conn.lock().await;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Store(e.to_string()))?;
        let next_seq: u64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM audit_events WHERE aggregate_id = ?1",
                params![event.aggregate_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        tx.execute(
            "INSERT INTO audit_events
                (event_id, event_type, event_version, aggregate_id, aggregate_type,
                 sequence_number, event_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.to_string(),
                event.event_type.as_str(),
                EVENT_SCHEMA_VERSION,
                event.aggregate_id,
                event.aggregate_type,
                next_seq,
                payload,
                created_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                Error::Store(format!("duplicate event id {}", event.id))
            } else {
                Error::Store(e.to_string())
            }
        })?;
        tx.commit().map_err(|e| Error::Store(e.to_string()))?;
        Ok(next_seq)
    }

    async fn stream(&self, since: DateTime<Utc>, batch_size: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_data, sequence_number, created_at, processed_at
                 FROM audit_events
                 WHERE created_at > ?1
                 ORDER BY created_at ASC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Store(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![Self::timestamp(since), batch_size as i64],
                |row| {
                    let data: String = row.get(0)?;
                    let sequence_number: u64 = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    let processed_at: Option<String> = row.get(3)?;
                    Ok((data, sequence_number, created_at, processed_at))
                },
            )
            .map_err(|e| Error::Store(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (data, sequence_number, created_at, processed_at) =
                row.map_err(|e| Error::Store(e.to_string()))?;
            let mut event: AuditEvent = serde_json::from_str(&data)?;
            event.sequence_num = sequence_number;
            out.push(StoredEvent {
                event,
                sequence_number,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| Error::Store(e.to_string()))?
                    .with_timezone(&Utc),
                processed_at: processed_at
                    .map(|raw| {
                        DateTime::parse_from_rfc3339(&raw)
                            .map(|dt| dt.with_timezone(&Utc))
                            .map_err(|e| Error::Store(e.to_string()))
                    })
                    .transpose()?,
            });
        }
        Ok(out)
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE audit_events SET processed_at = ?1 WHERE event_id = ?2",
                params![Self::timestamp(Utc::now()), event_id.to_string()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("stored event {event_id}")));
        }
        Ok(())
    }
}

impl SqliteEventStore {
    /// Sequence high-water mark for one aggregate, for tests and catch-up
    /// diagnostics.
    pub async fn last_sequence(&self, aggregate_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT MAX(sequence_number) FROM audit_events WHERE aggregate_id = ?1",
            params![aggregate_id],
            |row| row.get::<_, Option<u64>>(0),
        )
        .optional()
        .map(|v| v.flatten())
        .map_err(|e| Error::Store(e.to_string()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Severity};

    fn event(aggregate: &str) -> AuditEvent {
        AuditEvent::new(
            EventType::CallCreated,
            Severity::Info,
            "call",
            aggregate,
            "create",
            "success",
        )
    }

    #[tokio::test]
    async fn append_assigns_per_aggregate_sequences() {
        let store = SqliteEventStore::in_memory().unwrap();
        assert_eq!(store.append(&event("call-a")).await.unwrap(), 1);
        assert_eq!(store.append(&event("call-a")).await.unwrap(), 2);
        // Independent aggregate restarts at 1.
        assert_eq!(store.append(&event("call-b")).await.unwrap(), 1);
        assert_eq!(store.last_sequence("call-a").await.unwrap(), Some(2));
        assert_eq!(store.last_sequence("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = SqliteEventStore::in_memory().unwrap();
        let e = event("call-a");
        store.append(&e).await.unwrap();
        let err = store.append(&e).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn stream_returns_ascending_after_cutoff() {
        let store = SqliteEventStore::in_memory().unwrap();
        let before = Utc::now() - chrono::Duration::seconds(1);
        for i in 0..5 {
            store.append(&event(&format!("call-{i}"))).await.unwrap();
        }

        let all = store.stream(before, 100).await.unwrap();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }

        // Batch limit applies.
        let page = store.stream(before, 2).await.unwrap();
        assert_eq!(page.len(), 2);

        // A future cutoff yields nothing.
        let future = Utc::now() + chrono::Duration::seconds(10);
        assert!(store.stream(future, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_processed_round_trip() {
        let store = SqliteEventStore::in_memory().unwrap();
        let e = event("call-a");
        store.append(&e).await.unwrap();
        let before = Utc::now() - chrono::Duration::seconds(1);

        assert!(store.stream(before, 10).await.unwrap()[0]
            .processed_at
            .is_none());
        store.mark_processed(e.id).await.unwrap();
        assert!(store.stream(before, 10).await.unwrap()[0]
            .processed_at
            .is_some());

        let err = store.mark_processed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stored_event_round_trips_payload() {
        let store = SqliteEventStore::in_memory().unwrap();
        let e = event("call-a").with_actor("buyer-1").with_attribute("k", "v");
        store.append(&e).await.unwrap();

        let before = Utc::now() - chrono::Duration::seconds(1);
        let rows = store.stream(before, 10).await.unwrap();
        assert_eq!(rows[0].event.id, e.id);
        assert_eq!(rows[0].event.actor_id.as_deref(), Some("buyer-1"));
        assert_eq!(rows[0].sequence_number, 1);
        // The store's assignment is reflected on the event itself.
        assert_eq!(rows[0].event.sequence_num, 1);
    }

    #[tokio::test]
    async fn open_on_disk_persists(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let store = SqliteEventStore::open(&path).unwrap();
            store.append(&event("call-a")).await.unwrap();
        }
        let store = SqliteEventStore::open(&path).unwrap();
        assert_eq!(store.last_sequence("call-a").await.unwrap(), Some(1));
    }
}
