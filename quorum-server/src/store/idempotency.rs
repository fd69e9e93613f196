//! Idempotency record storage.
//!
//! A record is keyed by `(owner_id, key)` and claimed with an atomic
//! `INSERT OR IGNORE`; losers of the insert race classify the existing row.
//! Stale IN_PROGRESS claims (crash before completion) are reclaimed with a
//! conditional UPDATE guarded on the same predicate that found them stale,
//! so two racing reclaimers resolve to exactly one winner.

use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use super::SqliteStore;
use crate::error::StoreError;

/// Outcome of an acquisition attempt for `(owner, key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the claim and must run the handler.
    Acquired,
    /// A completed record with a matching fingerprint exists; return the
    /// stored response verbatim.
    Replay { status: u16, body: Value },
    /// Another attempt with the same key is currently executing.
    InProgress,
    /// The key was reused with a semantically different request.
    FingerprintMismatch,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn try_acquire_sync(
    conn: &Connection,
    owner_id: Uuid,
    key: &str,
    method: &str,
    path: &str,
    fingerprint: &str,
    now: i64,
    ttl_secs: i64,
    stale_cutoff: i64,
) -> Result<AcquireOutcome, StoreError> {
    let owner = owner_id.to_string();
    let expires_at = now + ttl_secs;

    // Atomic claim: if two requests race on a missing row, the loser's
    // insert is silently ignored and detected via changes() == 0.
    conn.execute(
        "INSERT OR IGNORE INTO idempotency_records
             (owner_id, key, method, path, fingerprint, status, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'IN_PROGRESS', ?6, ?7)",
        params![owner, key, method, path, fingerprint, now, expires_at],
    )
    .map_err(|e| StoreError::storage("try_acquire", e.to_string()))?;

    if conn.changes() > 0 {
        return Ok(AcquireOutcome::Acquired);
    }

    // Row already exists - classify it.
    let (status, existing_fp, response_status, response_body, created_at): (
        String,
        String,
        Option<u16>,
        Option<String>,
        i64,
    ) = conn
        .query_row(
            "SELECT status, fingerprint, response_status, response_body, created_at
             FROM idempotency_records WHERE owner_id = ?1 AND key = ?2",
            params![owner, key],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .map_err(|e| StoreError::storage("try_acquire", e.to_string()))?;

    match status.as_str() {
        "COMPLETED" => {
            if existing_fp != fingerprint {
                return Ok(AcquireOutcome::FingerprintMismatch);
            }
            let (Some(response_status), Some(body_json)) = (response_status, response_body) else {
                return Err(StoreError::corruption("completed idempotency record"));
            };
            let body: Value = serde_json::from_str(&body_json)
                .map_err(|_| StoreError::corruption("idempotency response body"))?;
            Ok(AcquireOutcome::Replay {
                status: response_status,
                body,
            })
        }
        "IN_PROGRESS" => {
            if existing_fp != fingerprint {
                return Ok(AcquireOutcome::FingerprintMismatch);
            }
            if created_at <= stale_cutoff {
                // Reclaim an abandoned claim. The conditional UPDATE guards
                // against a TOCTOU race where two callers both see the row
                // as stale: only one UPDATE matches.
                conn.execute(
                    "UPDATE idempotency_records
                     SET created_at = ?1, expires_at = ?2, method = ?3, path = ?4
                     WHERE owner_id = ?5 AND key = ?6
                       AND status = 'IN_PROGRESS' AND created_at <= ?7",
                    params![now, expires_at, method, path, owner, key, stale_cutoff],
                )
                .map_err(|e| StoreError::storage("try_acquire reclaim", e.to_string()))?;

                if conn.changes() > 0 {
                    Ok(AcquireOutcome::Acquired)
                } else {
                    Ok(AcquireOutcome::InProgress)
                }
            } else {
                Ok(AcquireOutcome::InProgress)
            }
        }
        _ => Err(StoreError::corruption("idempotency status")),
    }
}

/// Finalize a claim with the handler's successful response.
///
/// Guarded on IN_PROGRESS so a reclaimed-and-completed key is never
/// overwritten by a late straggler; completed records are immutable.
pub(crate) fn mark_completed_sync(
    conn: &Connection,
    owner_id: Uuid,
    key: &str,
    response_status: u16,
    response_body: &Value,
) -> Result<(), StoreError> {
    let body_json = serde_json::to_string(response_body)
        .map_err(|e| StoreError::storage("mark_completed serialize", e.to_string()))?;

    conn.execute(
        "UPDATE idempotency_records
         SET status = 'COMPLETED', response_status = ?1, response_body = ?2
         WHERE owner_id = ?3 AND key = ?4 AND status = 'IN_PROGRESS'",
        params![response_status, body_json, owner_id.to_string(), key],
    )
    .map_err(|e| StoreError::storage("mark_completed", e.to_string()))?;

    Ok(())
}

/// Delete an IN_PROGRESS claim so a failed attempt does not poison the key.
pub(crate) fn release_sync(conn: &Connection, owner_id: Uuid, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM idempotency_records
         WHERE owner_id = ?1 AND key = ?2 AND status = 'IN_PROGRESS'",
        params![owner_id.to_string(), key],
    )
    .map_err(|e| StoreError::storage("release", e.to_string()))?;
    Ok(())
}

/// Delete completed records whose replay window has expired.
///
/// IN_PROGRESS rows are never swept here; they are reclaimed lazily by the
/// next acquisition attempt once stale.
pub(crate) fn cleanup_expired_sync(conn: &Connection, now: i64) -> Result<usize, StoreError> {
    conn.execute(
        "DELETE FROM idempotency_records WHERE status = 'COMPLETED' AND expires_at <= ?1",
        params![now],
    )
    .map_err(|e| StoreError::storage("cleanup_expired_idempotency", e.to_string()))
}

// =============================================================================
// Async wrappers
// =============================================================================

impl SqliteStore {
    #[allow(clippy::too_many_arguments)]
    pub async fn try_acquire_idempotency(
        &self,
        owner_id: Uuid,
        key: &str,
        method: &str,
        path: &str,
        fingerprint: &str,
        ttl_secs: i64,
        stale_secs: i64,
    ) -> Result<AcquireOutcome, StoreError> {
        let key = key.to_string();
        let method = method.to_string();
        let path = path.to_string();
        let fingerprint = fingerprint.to_string();

        self.call("try_acquire", move |conn| {
            let now = super::now_secs();
            try_acquire_sync(
                conn,
                owner_id,
                &key,
                &method,
                &path,
                &fingerprint,
                now,
                ttl_secs,
                now - stale_secs,
            )
        })
        .await
    }

    pub async fn complete_idempotency(
        &self,
        owner_id: Uuid,
        key: &str,
        response_status: u16,
        response_body: Value,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        self.call("mark_completed", move |conn| {
            mark_completed_sync(conn, owner_id, &key, response_status, &response_body)
        })
        .await
    }

    pub async fn release_idempotency(&self, owner_id: Uuid, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.call("release", move |conn| release_sync(conn, owner_id, &key))
            .await
    }

    pub async fn cleanup_expired_idempotency(&self) -> Result<usize, StoreError> {
        self.call("cleanup_expired_idempotency", move |conn| {
            cleanup_expired_sync(conn, super::now_secs())
        })
        .await
    }
}
