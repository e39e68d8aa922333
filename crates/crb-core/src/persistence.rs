//! Write-through / read-back of session status for crash recovery.
//!
//! Writes are fire-and-forget for callers but applied in submission order by a
//! single writer task. Reads go through the same queue so they observe every
//! write submitted before them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{domain::TenantId, errors::Error, Result};

/// Persisted session row, keyed by tenant id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub tenant_id: TenantId,
    /// Opaque credential-derived blob (JSON text).
    pub session_data: String,
    pub is_connected: bool,
    pub connection_status: String,
    pub last_activity: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hexagonal port for the relational session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the row for `record.tenant_id` (last writer wins).
    async fn upsert(&self, record: &SessionRecord) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<SessionRecord>>;
    async fn load_connected(&self) -> Result<Vec<SessionRecord>>;
}

// ============== SQLite ==============

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messaging_sessions (
    tenant_id TEXT PRIMARY KEY,
    session_data TEXT NOT NULL,
    is_connected INTEGER NOT NULL DEFAULT 0,
    connection_status TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const SELECT_COLUMNS: &str =
    "SELECT tenant_id, session_data, is_connected, connection_status, last_activity, updated_at FROM messaging_sessions";

/// SQLite-backed store. Blocking calls run on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open a database from a connection string.
    ///
    /// Accepts a plain path, a `sqlite://` URL or `:memory:`.
    pub fn open(url: &str) -> Result<Self> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let out = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| Error::External(format!("storage task failed: {e}")))?;
        Ok(out?)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let tenant_raw: String = row.get(0)?;
    let tenant_id = TenantId::parse(&tenant_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SessionRecord {
        tenant_id,
        session_data: row.get(1)?,
        is_connected: row.get(2)?,
        connection_status: row.get(3)?,
        last_activity: parse_timestamp(row, 4)?,
        updated_at: parse_timestamp(row, 5)?,
    })
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn query_records(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], record_from_row)?;
    rows.collect()
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let r = record.clone();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO messaging_sessions
                    (tenant_id, session_data, is_connected, connection_status, last_activity, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(tenant_id) DO UPDATE SET
                    session_data = excluded.session_data,
                    is_connected = excluded.is_connected,
                    connection_status = excluded.connection_status,
                    last_activity = excluded.last_activity,
                    updated_at = excluded.updated_at
                "#,
                params![
                    r.tenant_id.as_str(),
                    r.session_data,
                    r.is_connected,
                    r.connection_status,
                    r.last_activity.to_rfc3339(),
                    r.updated_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        self.run(|conn| query_records(conn, &format!("{SELECT_COLUMNS} ORDER BY tenant_id")))
            .await
    }

    async fn load_connected(&self) -> Result<Vec<SessionRecord>> {
        self.run(|conn| {
            query_records(
                conn,
                &format!("{SELECT_COLUMNS} WHERE is_connected = 1 ORDER BY tenant_id"),
            )
        })
        .await
    }
}

// ============== In-memory ==============

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<BTreeMap<TenantId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &TenantId) -> Option<SessionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn load_connected(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.is_connected)
            .collect())
    }
}

// ============== Ordered writer ==============

enum Op {
    Upsert {
        record: SessionRecord,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    LoadAll {
        reply: oneshot::Sender<Result<Vec<SessionRecord>>>,
    },
    LoadConnected {
        reply: oneshot::Sender<Result<Vec<SessionRecord>>>,
    },
}

/// Handle to the persistence writer task.
#[derive(Clone)]
pub struct Persistence {
    tx: mpsc::UnboundedSender<Op>,
}

impl Persistence {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Op>();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    Op::Upsert { record, ack } => {
                        let res = store.upsert(&record).await;
                        match ack {
                            Some(ack) => {
                                let _ = ack.send(res);
                            }
                            None => {
                                if let Err(e) = res {
                                    tracing::warn!(tenant = %record.tenant_id, "session record write failed: {e}");
                                }
                            }
                        }
                    }
                    Op::LoadAll { reply } => {
                        let _ = reply.send(store.load_all().await);
                    }
                    Op::LoadConnected { reply } => {
                        let _ = reply.send(store.load_connected().await);
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a write without waiting for it.
    pub fn submit(&self, record: SessionRecord) {
        if self.tx.send(Op::Upsert { record, ack: None }).is_err() {
            tracing::debug!("persistence writer stopped; dropping session record");
        }
    }

    /// Queue a write and wait until the store acknowledged it.
    pub async fn submit_acked(&self, record: SessionRecord) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Op::Upsert {
                record,
                ack: Some(ack),
            })
            .map_err(|_| writer_stopped())?;
        rx.await.map_err(|_| writer_stopped())?
    }

    pub async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Op::LoadAll { reply })
            .map_err(|_| writer_stopped())?;
        rx.await.map_err(|_| writer_stopped())?
    }

    pub async fn load_connected(&self) -> Result<Vec<SessionRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Op::LoadConnected { reply })
            .map_err(|_| writer_stopped())?;
        rx.await.map_err(|_| writer_stopped())?
    }
}

fn writer_stopped() -> Error {
    Error::External("persistence writer stopped".to_string())
}
