//! Durable offline action queue.
//!
//! Every mutating driver request that cannot be delivered immediately is
//! appended here and replayed later by the sync engine. Rows live in the
//! local SQLite `action_queue` table, ordered FIFO by insertion, and are
//! removed only on a confirmed successful remote apply. Exhausted entries
//! (five failed attempts) stay visible for diagnostics instead of being
//! silently dropped.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::TerminalError;

/// After this many failed replay attempts an action is skipped by the drain
/// loop and counted as an error needing manual attention.
pub const MAX_RETRIES: i64 = 5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Classifies a queued action for diagnostics. Dispatch logic replays the
/// stored endpoint/method/payload verbatim regardless of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    DeliveryStatus,
    ProofUpload,
    PettyCash,
    LocationUpdate,
    FailedDelivery,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::DeliveryStatus => "delivery-status",
            ActionType::ProofUpload => "proof-upload",
            ActionType::PettyCash => "petty-cash",
            ActionType::LocationUpdate => "location-update",
            ActionType::FailedDelivery => "failed-delivery",
        }
    }
}

impl FromStr for ActionType {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery-status" => Ok(ActionType::DeliveryStatus),
            "proof-upload" => Ok(ActionType::ProofUpload),
            "petty-cash" => Ok(ActionType::PettyCash),
            "location-update" => Ok(ActionType::LocationUpdate),
            "failed-delivery" => Ok(ActionType::FailedDelivery),
            other => Err(TerminalError::Internal(format!(
                "unknown action type in queue: {other}"
            ))),
        }
    }
}

/// A locally persisted, not-yet-confirmed mutating request awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Enqueue-time id (millis + random suffix). Doubles as the idempotency
    /// key sent with every replay of this action.
    pub id: String,
    pub action_type: ActionType,
    pub endpoint: String,
    pub method: String,
    /// Opaque JSON payload, replayed verbatim.
    pub data: Value,
    pub created_at: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

/// Partial update applied to a queued action (retry bookkeeping).
#[derive(Debug, Default, Clone)]
pub struct QueueUpdate {
    pub retry_count: Option<i64>,
    pub last_error: Option<String>,
}

/// Aggregate queue state for the driver-facing sync indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub total: i64,
    /// Actions that will still be retried automatically.
    pub pending: i64,
    /// Actions that exhausted their retries and need attention.
    pub errors: i64,
    /// True while a drain pass is in progress.
    pub syncing: bool,
    pub last_sync_time: Option<String>,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Handle over the persistent action queue. Cheap to clone; all clones share
/// the same injected database state.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<DbState>,
}

/// Generate an enqueue-time action id: wall-clock millis plus a random
/// suffix to avoid collisions within the same millisecond.
fn new_action_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

impl OfflineQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TerminalError> {
        self.db
            .conn
            .lock()
            .map_err(|e| TerminalError::Internal(e.to_string()))
    }

    /// Append a new action. The write is a single INSERT inside SQLite's
    /// implicit transaction; a storage failure propagates to the caller
    /// because losing a queued mutation would corrupt dispatch state.
    pub fn enqueue(
        &self,
        action_type: ActionType,
        endpoint: &str,
        method: &str,
        data: Value,
    ) -> Result<QueuedAction, TerminalError> {
        let method = method.to_uppercase();
        if !matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            return Err(TerminalError::UnsupportedMethod(method));
        }

        let action = QueuedAction {
            id: new_action_id(),
            action_type,
            endpoint: endpoint.to_string(),
            method,
            data,
            created_at: Utc::now().to_rfc3339(),
            retry_count: 0,
            last_error: None,
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO action_queue (id, action_type, endpoint, method, payload, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                action.id,
                action.action_type.as_str(),
                action.endpoint,
                action.method,
                action.data.to_string(),
                action.created_at,
            ],
        )?;

        info!(
            action_id = %action.id,
            action_type = action.action_type.as_str(),
            endpoint = %action.endpoint,
            "action queued for offline sync"
        );
        Ok(action)
    }

    /// All queued actions in insertion (FIFO) order.
    pub fn list(&self) -> Result<Vec<QueuedAction>, TerminalError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, action_type, endpoint, method, payload, created_at, retry_count, last_error
             FROM action_queue ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut actions = Vec::with_capacity(rows.len());
        for (id, type_raw, endpoint, method, payload, created_at, retry_count, last_error) in rows {
            actions.push(QueuedAction {
                id,
                action_type: ActionType::from_str(&type_raw)?,
                endpoint,
                method,
                data: serde_json::from_str(&payload)
                    .map_err(|e| TerminalError::Internal(format!("corrupt queue payload: {e}")))?,
                created_at,
                retry_count,
                last_error,
            });
        }
        Ok(actions)
    }

    /// Delete an action after a confirmed remote apply. No-op if absent.
    pub fn remove(&self, id: &str) -> Result<(), TerminalError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM action_queue WHERE id = ?1", params![id])?;
        if deleted > 0 {
            debug!(action_id = %id, "action removed from queue");
        }
        Ok(())
    }

    /// Merge retry bookkeeping into an action. Fields left `None` keep their
    /// current value. No-op if the action is absent.
    pub fn update(&self, id: &str, patch: QueueUpdate) -> Result<(), TerminalError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE action_queue
             SET retry_count = COALESCE(?1, retry_count),
                 last_error = COALESCE(?2, last_error),
                 last_attempt_at = datetime('now')
             WHERE id = ?3",
            params![patch.retry_count, patch.last_error, id],
        )?;
        Ok(())
    }

    /// Aggregate counts plus the last drain time. The `syncing` flag belongs
    /// to the sync engine and is passed through here so callers get one
    /// coherent status record.
    pub fn status(&self, syncing: bool) -> Result<QueueStatus, TerminalError> {
        let conn = self.conn()?;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM action_queue", [], |row| row.get(0))?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_queue WHERE retry_count < ?1",
            params![MAX_RETRIES],
            |row| row.get(0),
        )?;
        let errors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_queue WHERE retry_count >= ?1",
            params![MAX_RETRIES],
            |row| row.get(0),
        )?;
        let last_sync_time = db::get_setting(&conn, "sync", "last_sync_time");

        Ok(QueueStatus {
            total,
            pending,
            errors,
            syncing,
            last_sync_time,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
