//! Guarded state transitions for approvable entities.
//!
//! Every approvable row (proposal, membership) moves PENDING -> ACCEPTED or
//! PENDING -> REJECTED at most once. The transition is a single conditional
//! UPDATE guarded on `status = 'PENDING'`; the database's atomic write is
//! the only synchronization primitive, so the guarantee holds across
//! processes without any application-level locking. Exactly one of any
//! number of concurrent callers observes a matched row; the rest see `None`
//! and must re-read the current status to report the conflict.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Lifecycle status of an approvable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Accepted => "ACCEPTED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ApprovalStatus::Pending),
            "ACCEPTED" => Some(ApprovalStatus::Accepted),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// Terminal status requested by an approval or rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    Rejected,
}

impl Resolution {
    pub fn status(&self) -> ApprovalStatus {
        match self {
            Resolution::Accepted => ApprovalStatus::Accepted,
            Resolution::Rejected => ApprovalStatus::Rejected,
        }
    }

    /// Timestamp column stamped by the transition.
    fn timestamp_column(&self) -> &'static str {
        match self {
            Resolution::Accepted => "accepted_at",
            Resolution::Rejected => "rejected_at",
        }
    }
}

/// An entity kind that participates in guarded transitions.
///
/// Implementors supply the table metadata and row mapping; the transition
/// SQL itself is shared.
pub trait Approvable: Sized {
    /// Table holding the entity rows.
    const TABLE: &'static str;
    /// Select list matching `from_row`, used in RETURNING clauses.
    const COLUMNS: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Atomically resolve an entity if it is still PENDING.
///
/// Returns the updated row when this caller won the transition, or `None`
/// when someone else already resolved the entity (or it does not exist).
pub(crate) fn try_transition_sync<T: Approvable>(
    conn: &Connection,
    id: Uuid,
    to: Resolution,
    now: i64,
) -> Result<Option<T>, StoreError> {
    let sql = format!(
        "UPDATE {table} SET status = ?1, {ts} = ?2
         WHERE id = ?3 AND status = 'PENDING'
         RETURNING {cols}",
        table = T::TABLE,
        ts = to.timestamp_column(),
        cols = T::COLUMNS,
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::storage("try_transition", e.to_string()))?;

    stmt.query_row(
        params![to.status().as_str(), now, id.to_string()],
        T::from_row,
    )
    .optional()
    .map_err(|e| StoreError::storage("try_transition", e.to_string()))
}

/// Read the current status of an entity, `None` if it does not exist.
pub(crate) fn current_status_sync<T: Approvable>(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<ApprovalStatus>, StoreError> {
    let sql = format!("SELECT status FROM {} WHERE id = ?1", T::TABLE);

    let status: Option<String> = conn
        .query_row(&sql, params![id.to_string()], |row| row.get(0))
        .optional()
        .map_err(|e| StoreError::storage("current_status", e.to_string()))?;

    match status {
        Some(s) => ApprovalStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| StoreError::corruption("approvable status")),
        None => Ok(None),
    }
}
