//! Transactional outbox.
//!
//! Events are appended inside the same transaction as the business write
//! that caused them, then consumed on two independent paths:
//!
//! - the SSE stream reads by `(room_id, id > cursor)`, so the AUTOINCREMENT
//!   id doubles as the resume cursor
//! - the dispatcher claims PENDING rows with a conditional UPDATE and
//!   retries failures with exponential backoff until dead-lettered
//!
//! SQLite has a single writer, so a conditional UPDATE stamping
//! `locked_at`/`locked_by` is a sufficient claim primitive; no two workers
//! can match the same row.

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{now_secs, parse_uuid, usize_to_i64_limit, SqliteStore};
use crate::error::StoreError;

/// An event row as seen by stream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEventRow {
    pub id: i64,
    pub event_type: String,
    pub room_id: Uuid,
    pub payload: Value,
    pub created_at: i64,
}

impl OutboxEventRow {
    const COLUMNS: &'static str = "id, event_type, room_id, payload, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, i64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn build(raw: (i64, String, String, String, i64)) -> Result<Self, StoreError> {
        Ok(OutboxEventRow {
            id: raw.0,
            event_type: raw.1,
            room_id: parse_uuid(&raw.2, "outbox room_id")?,
            payload: serde_json::from_str(&raw.3)
                .map_err(|_| StoreError::corruption("outbox payload"))?,
            created_at: raw.4,
        })
    }
}

/// A PENDING event claimed by a dispatch worker.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub id: i64,
    pub event_type: String,
    pub room_id: Uuid,
    pub payload: Value,
    pub attempts: u32,
}

/// Append an event. Must be called inside the transaction of the business
/// write that produced it.
pub(crate) fn append_sync(
    conn: &Connection,
    event_type: &str,
    room_id: Uuid,
    payload: &Value,
    now: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO outbox_events (event_type, room_id, payload, created_at, next_retry_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            event_type,
            room_id.to_string(),
            payload.to_string(),
            now
        ],
    )
    .map_err(|e| StoreError::storage("outbox append", e.to_string()))?;

    Ok(conn.last_insert_rowid())
}

/// Events for one room strictly after `cursor`, oldest first.
pub(crate) fn poll_after_sync(
    conn: &Connection,
    room_id: Uuid,
    cursor: i64,
    limit: usize,
) -> Result<Vec<OutboxEventRow>, StoreError> {
    let limit = usize_to_i64_limit(limit, "outbox poll")?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM outbox_events
             WHERE room_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
            OutboxEventRow::COLUMNS
        ))
        .map_err(|e| StoreError::storage("outbox poll", e.to_string()))?;

    let rows = stmt
        .query_map(
            params![room_id.to_string(), cursor, limit],
            OutboxEventRow::from_row,
        )
        .map_err(|e| StoreError::storage("outbox poll", e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::storage("outbox poll", e.to_string()))?;

    rows.into_iter().map(OutboxEventRow::build).collect()
}

/// Claim up to `limit` dispatchable events for `worker_id`.
///
/// Dispatchable means PENDING, due for (re)try, and either unlocked or
/// holding a lock older than `lock_ttl_secs` (a crashed worker's leftovers).
pub(crate) fn claim_pending_sync(
    conn: &mut Connection,
    worker_id: &str,
    limit: usize,
    lock_ttl_secs: i64,
    now: i64,
) -> Result<Vec<ClaimedEvent>, StoreError> {
    let limit = usize_to_i64_limit(limit, "outbox claim")?;
    let lock_cutoff = now - lock_ttl_secs;

    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("outbox claim", e.to_string()))?;

    let claimed = {
        let mut stmt = tx
            .prepare(
                "UPDATE outbox_events
                 SET locked_at = ?1, locked_by = ?2
                 WHERE id IN (
                     SELECT id FROM outbox_events
                     WHERE dispatch_status = 'PENDING'
                       AND next_retry_at <= ?1
                       AND (locked_at IS NULL OR locked_at <= ?3)
                     ORDER BY id ASC
                     LIMIT ?4
                 )
                 RETURNING id, event_type, room_id, payload, attempts",
            )
            .map_err(|e| StoreError::storage("outbox claim", e.to_string()))?;

        let rows = stmt
            .query_map(params![now, worker_id, lock_cutoff, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            })
            .map_err(|e| StoreError::storage("outbox claim", e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::storage("outbox claim", e.to_string()))?;

        rows.into_iter()
            .map(|(id, event_type, room_id, payload, attempts)| {
                Ok(ClaimedEvent {
                    id,
                    event_type,
                    room_id: parse_uuid(&room_id, "outbox room_id")?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|_| StoreError::corruption("outbox payload"))?,
                    attempts,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?
    };

    tx.commit()
        .map_err(|e| StoreError::storage("outbox claim", e.to_string()))?;

    Ok(claimed)
}

pub(crate) fn mark_done_sync(conn: &Connection, id: i64, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE outbox_events
         SET dispatch_status = 'DONE', processed_at = ?1, locked_at = NULL, locked_by = NULL
         WHERE id = ?2",
        params![now, id],
    )
    .map_err(|e| StoreError::storage("outbox mark_done", e.to_string()))?;
    Ok(())
}

/// Record a delivery failure.
///
/// The attempt counter increments atomically in the UPDATE; the returned
/// value decides between scheduling a retry (backoff of `2^attempts`
/// seconds) and dead-lettering as FAILED.
pub(crate) fn mark_failed_sync(
    conn: &Connection,
    id: i64,
    error: &str,
    max_attempts: u32,
    now: i64,
) -> Result<u32, StoreError> {
    let attempts: u32 = conn
        .query_row(
            "UPDATE outbox_events
             SET attempts = attempts + 1, last_error = ?1,
                 locked_at = NULL, locked_by = NULL
             WHERE id = ?2
             RETURNING attempts",
            params![error, id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::storage("outbox mark_failed", e.to_string()))?;

    if attempts >= max_attempts {
        conn.execute(
            "UPDATE outbox_events
             SET dispatch_status = 'FAILED', processed_at = ?1
             WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| StoreError::storage("outbox mark_failed", e.to_string()))?;
    } else {
        let backoff = 2_i64.saturating_pow(attempts);
        conn.execute(
            "UPDATE outbox_events SET next_retry_at = ?1 WHERE id = ?2",
            params![now + backoff, id],
        )
        .map_err(|e| StoreError::storage("outbox mark_failed", e.to_string()))?;
    }

    Ok(attempts)
}

/// Delete terminal rows older than the retention window.
///
/// PENDING rows are never deleted regardless of age; losing an undelivered
/// event is worse than a slightly larger table.
pub(crate) fn cleanup_old_sync(
    conn: &Connection,
    retention_secs: i64,
    now: i64,
) -> Result<usize, StoreError> {
    conn.execute(
        "DELETE FROM outbox_events
         WHERE dispatch_status IN ('DONE', 'FAILED') AND created_at <= ?1",
        params![now - retention_secs],
    )
    .map_err(|e| StoreError::storage("outbox cleanup", e.to_string()))
}

impl SqliteStore {
    pub async fn poll_events_after(
        &self,
        room_id: Uuid,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, StoreError> {
        self.call("outbox poll", move |conn| {
            poll_after_sync(conn, room_id, cursor, limit)
        })
        .await
    }

    pub async fn claim_pending_events(
        &self,
        worker_id: String,
        limit: usize,
        lock_ttl_secs: i64,
    ) -> Result<Vec<ClaimedEvent>, StoreError> {
        self.call("outbox claim", move |conn| {
            claim_pending_sync(conn, &worker_id, limit, lock_ttl_secs, now_secs())
        })
        .await
    }

    pub async fn mark_event_done(&self, id: i64) -> Result<(), StoreError> {
        self.call("outbox mark_done", move |conn| {
            mark_done_sync(conn, id, now_secs())
        })
        .await
    }

    pub async fn mark_event_failed(
        &self,
        id: i64,
        error: String,
        max_attempts: u32,
    ) -> Result<u32, StoreError> {
        self.call("outbox mark_failed", move |conn| {
            mark_failed_sync(conn, id, &error, max_attempts, now_secs())
        })
        .await
    }

    pub async fn cleanup_old_events(&self, retention_secs: i64) -> Result<usize, StoreError> {
        self.call("outbox cleanup", move |conn| {
            cleanup_old_sync(conn, retention_secs, now_secs())
        })
        .await
    }
}
