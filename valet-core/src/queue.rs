//! Approval Queue (C10): a durable, transactional store of [`QueueItem`]s
//! with tab derivation and undo (spec.md §4.10).
//!
//! `rusqlite`-backed, following the teacher's `SqliteMemoryStore` idiom in
//! `memory/store.rs`: an `Arc<Mutex<Connection>>`, a `with_conn` helper, and
//! a small hand-rolled schema-version migration table rather than an
//! external migration crate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{EventBus, EventEnvelope, EventKind};
use crate::error::{Error, Result};
use crate::executor::{ActionBackend, CompensationHandle};

pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    ToProcess,
    InProgress,
    Snoozed,
    Done,
    Rejected,
    Errored,
}

impl QueueStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ToProcess => "to_process",
            Self::InProgress => "in_progress",
            Self::Snoozed => "snoozed",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Errored => "errored",
        }
    }

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "to_process" => Ok(Self::ToProcess),
            "in_progress" => Ok(Self::InProgress),
            "snoozed" => Ok(Self::Snoozed),
            "done" => Ok(Self::Done),
            "rejected" => Ok(Self::Rejected),
            "errored" => Ok(Self::Errored),
            other => Err(Error::Storage(format!("unknown queue status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTab {
    ToProcess,
    InProgress,
    Snoozed,
    History,
    Errors,
}

impl QueueTab {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ToProcess => "to_process",
            Self::InProgress => "in_progress",
            Self::Snoozed => "snoozed",
            Self::History => "history",
            Self::Errors => "errors",
        }
    }
}

/// SQL `CASE` projection deriving a tab from `(status, snoozed_until,
/// last_error)` (spec.md §4.10). `last_error` wins over every other state
/// so a failed item is always reachable from Errors.
const TAB_CASE_EXPR: &str = "
    CASE
        WHEN last_error IS NOT NULL THEN 'errors'
        WHEN status = 'snoozed' THEN 'snoozed'
        WHEN status = 'in_progress' THEN 'in_progress'
        WHEN status IN ('done', 'rejected') THEN 'history'
        ELSE 'to_process'
    END
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub status: QueueStatus,
    /// Full analysis snapshot including stage traces (spec.md §6
    /// `get_item` semantics), opaque to the queue itself.
    pub snapshot: Value,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub to_process: u64,
    pub in_progress: u64,
    pub snoozed: u64,
    pub history: u64,
    pub errors: u64,
}

struct PendingUndo {
    compensations: Vec<CompensationHandle>,
    expires_at: DateTime<Utc>,
}

pub struct ApprovalQueue {
    conn: Arc<Mutex<Connection>>,
    handles: Mutex<HashMap<String, PendingUndo>>,
    undo_window: chrono::Duration,
    bus: EventBus,
}

impl ApprovalQueue {
    pub fn open(path: impl AsRef<Path>, undo_window_seconds: u64, bus: EventBus) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn, undo_window_seconds, bus)
    }

    pub fn in_memory(undo_window_seconds: u64) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn, undo_window_seconds, EventBus::default())
    }

    fn from_connection(conn: Connection, undo_window_seconds: u64, bus: EventBus) -> Result<Self> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            handles: Mutex::new(HashMap::new()),
            undo_window: chrono::Duration::seconds(undo_window_seconds.max(1) as i64),
            bus,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("queue connection lock poisoned: {e}")))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Spawn the background sweep task expiring undo handles past their
    /// window. Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(30));
            loop {
                ticker.tick().await;
                queue.sweep_expired();
            }
        })
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|_, pending| pending.expires_at > now);
        }
    }

    /// Insert a new item, deduplicating on `(source, source_id)`. Returns
    /// the existing item unchanged if one already occupies that slot.
    pub fn enqueue(&self, source: &str, source_id: &str, snapshot: Value) -> Result<QueueItem> {
        if let Some(existing) = self.find_by_source(source, source_id)? {
            return Ok(existing);
        }
        let id = format!("{source}:{source_id}");
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_items
                    (id, source, source_id, status, snapshot, snoozed_until, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?6)",
                params![
                    id,
                    source,
                    source_id,
                    QueueStatus::ToProcess.as_str(),
                    snapshot.to_string(),
                    now.to_rfc3339(),
                ],
            )
        })?;
        self.bus.publish(EventEnvelope::new(
            id.clone(),
            EventKind::QueueEnqueued { queue_item_id: id.clone() },
            now,
        ));
        Ok(QueueItem {
            id,
            source: source.to_string(),
            source_id: source_id.to_string(),
            status: QueueStatus::ToProcess,
            snapshot,
            snoozed_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn find_by_source(&self, source: &str, source_id: &str) -> Result<Option<QueueItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source, source_id, status, snapshot, snoozed_until, last_error, created_at, updated_at
                 FROM queue_items WHERE source = ?1 AND source_id = ?2",
                params![source, source_id],
                row_to_item,
            )
            .optional()
        })
    }

    /// Shared handle to the underlying connection, so [`crate::calibration::Calibrator`]
    /// can co-locate its tables in the same database (spec.md §6).
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn get_item(&self, id: &str) -> Result<Option<QueueItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source, source_id, status, snapshot, snoozed_until, last_error, created_at, updated_at
                 FROM queue_items WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()
        })
    }

    /// Transition an item to `in_progress` ahead of planner+executor
    /// running the chosen option; the caller records the resulting
    /// compensation handles via [`Self::record_approval`].
    pub fn begin_approval(&self, id: &str) -> Result<()> {
        self.set_status(id, QueueStatus::InProgress, None)
    }

    /// Mark an item `done` and keep its compensation handles alive for the
    /// undo window (spec.md §6 `approve` returns an undo token; here the
    /// token is simply `id` itself, valid while a [`PendingUndo`] exists).
    pub fn record_approval(&self, id: &str, option: &str, compensations: Vec<CompensationHandle>) -> Result<()> {
        self.set_status(id, QueueStatus::Done, None)?;
        let expires_at = Utc::now() + self.undo_window;
        self.handles
            .lock()
            .map_err(|e| Error::Internal(format!("handle map lock poisoned: {e}")))?
            .insert(id.to_string(), PendingUndo { compensations, expires_at });
        self.bus.publish(EventEnvelope::new(
            id.to_string(),
            EventKind::QueueApproved { queue_item_id: id.to_string(), option: option.to_string() },
            Utc::now(),
        ));
        Ok(())
    }

    pub fn fail_approval(&self, id: &str, reason: &str) -> Result<()> {
        self.set_status(id, QueueStatus::Errored, Some(reason))
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<()> {
        self.set_status(id, QueueStatus::Rejected, None)?;
        self.bus.publish(EventEnvelope::new(
            id.to_string(),
            EventKind::QueueRejected { queue_item_id: id.to_string(), reason: reason.to_string() },
            Utc::now(),
        ));
        Ok(())
    }

    pub fn snooze(&self, id: &str, until: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_items SET status = ?2, snoozed_until = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, QueueStatus::Snoozed.as_str(), until.to_rfc3339(), Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn cancel_snooze(&self, id: &str) -> Result<()> {
        self.set_status(id, QueueStatus::ToProcess, None)
    }

    /// Undo an approval while its token is live: rolls back every
    /// compensation handle via `backend`, reopens the item, and consumes
    /// the token. Returns `false` if the token already expired or the item
    /// was never approved.
    pub async fn undo(&self, id: &str, backend: &dyn ActionBackend) -> Result<bool> {
        let pending = {
            let mut handles = self
                .handles
                .lock()
                .map_err(|e| Error::Internal(format!("handle map lock poisoned: {e}")))?;
            if let Some(pending) = handles.get(id) {
                if pending.expires_at <= Utc::now() {
                    handles.remove(id);
                    None
                } else {
                    handles.remove(id)
                }
            } else {
                None
            }
        };

        let Some(pending) = pending else {
            return Ok(false);
        };

        for handle in pending.compensations.iter().rev() {
            if handle.reversible {
                backend.rollback(handle).await?;
            }
        }
        self.set_status(id, QueueStatus::ToProcess, None)?;
        self.bus.publish(EventEnvelope::new(
            id.to_string(),
            EventKind::QueueUndone { queue_item_id: id.to_string() },
            Utc::now(),
        ));
        Ok(true)
    }

    fn set_status(&self, id: &str, status: QueueStatus, last_error: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_items SET status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, status.as_str(), last_error, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn list_by_tab(&self, tab: QueueTab, limit: usize, offset: usize) -> Result<Vec<QueueItem>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, source, source_id, status, snapshot, snoozed_until, last_error, created_at, updated_at
                 FROM queue_items
                 WHERE ({TAB_CASE_EXPR}) = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![tab.as_str(), limit as i64, offset as i64], row_to_item)?;
            rows.collect()
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.with_conn(|conn| {
            let sql = format!("SELECT ({TAB_CASE_EXPR}) as tab, COUNT(*) FROM queue_items GROUP BY tab");
            let mut stmt = conn.prepare(&sql)?;
            let mut stats = QueueStats::default();
            let rows = stmt.query_map([], |row| {
                let tab: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((tab, count as u64))
            })?;
            for row in rows {
                let (tab, count) = row?;
                match tab.as_str() {
                    "to_process" => stats.to_process = count,
                    "in_progress" => stats.in_progress = count,
                    "snoozed" => stats.snoozed = count,
                    "history" => stats.history = count,
                    "errors" => stats.errors = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    let status_raw: String = row.get(3)?;
    let snapshot_raw: String = row.get(4)?;
    let snoozed_raw: Option<String> = row.get(5)?;
    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;

    Ok(QueueItem {
        id: row.get(0)?,
        source: row.get(1)?,
        source_id: row.get(2)?,
        status: QueueStatus::from_str(&status_raw).unwrap_or(QueueStatus::Errored),
        snapshot: serde_json::from_str(&snapshot_raw).unwrap_or(Value::Null),
        snoozed_until: snoozed_raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
        last_error: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| Error::Storage(e.to_string()))?;

    let current_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                source_id TEXT NOT NULL,
                status TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                snoozed_until TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source, source_id)
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status_created ON queue_items(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_queue_snoozed ON queue_items(snoozed_until);
            INSERT INTO schema_version (version) VALUES (1);",
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
    }

    Ok(())
}
