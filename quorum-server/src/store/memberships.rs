//! Membership storage.
//!
//! A membership is an approvable entity: it is created PENDING (unless the
//! room auto-approves joins) and resolved by an admin through the shared
//! guarded transition.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::transition::{
    current_status_sync, try_transition_sync, Approvable, ApprovalStatus, Resolution,
};
use super::{now_secs, outbox, parse_uuid, rooms, SqliteStore};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
}

impl MemberRole {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "member" => Some(MemberRole::Member),
            "admin" => Some(MemberRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub status: ApprovalStatus,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
    pub rejected_at: Option<i64>,
}

struct RawMembership {
    id: String,
    room_id: String,
    user_id: String,
    role: String,
    status: String,
    created_at: i64,
    accepted_at: Option<i64>,
    rejected_at: Option<i64>,
}

impl Approvable for RawMembership {
    const TABLE: &'static str = "memberships";
    const COLUMNS: &'static str =
        "id, room_id, user_id, role, status, created_at, accepted_at, rejected_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawMembership {
            id: row.get(0)?,
            room_id: row.get(1)?,
            user_id: row.get(2)?,
            role: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            accepted_at: row.get(6)?,
            rejected_at: row.get(7)?,
        })
    }
}

impl RawMembership {
    fn build(self) -> Result<MembershipRow, StoreError> {
        Ok(MembershipRow {
            id: parse_uuid(&self.id, "membership id")?,
            room_id: parse_uuid(&self.room_id, "membership room_id")?,
            user_id: parse_uuid(&self.user_id, "membership user_id")?,
            role: MemberRole::parse(&self.role)
                .ok_or_else(|| StoreError::corruption("membership role"))?,
            status: ApprovalStatus::parse(&self.status)
                .ok_or_else(|| StoreError::corruption("membership status"))?,
            created_at: self.created_at,
            accepted_at: self.accepted_at,
            rejected_at: self.rejected_at,
        })
    }
}

#[derive(Debug)]
pub enum MembershipCreateOutcome {
    Created(MembershipRow),
    RoomNotFound,
    /// The user already has a membership in this room, in any status.
    Duplicate,
}

#[derive(Debug)]
pub enum MembershipResolveOutcome {
    Resolved(MembershipRow),
    AlreadyResolved(ApprovalStatus),
    NotFound,
    NotAdmin,
}

/// Request to join a room. Auto-approving rooms accept immediately; others
/// leave the membership PENDING for an admin.
pub(crate) fn create_membership_sync(
    conn: &mut Connection,
    room_id: Uuid,
    user_id: Uuid,
    now: i64,
) -> Result<MembershipCreateOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("create_membership", e.to_string()))?;

    let Some(room) = rooms::get_room_sync(&tx, room_id)? else {
        return Ok(MembershipCreateOutcome::RoomNotFound);
    };

    let auto = room.settings.auto_approve_memberships;
    let status = if auto {
        ApprovalStatus::Accepted
    } else {
        ApprovalStatus::Pending
    };

    let membership_id = Uuid::new_v4();
    tx.execute(
        "INSERT OR IGNORE INTO memberships
             (id, room_id, user_id, role, status, created_at, accepted_at)
         VALUES (?1, ?2, ?3, 'member', ?4, ?5, ?6)",
        params![
            membership_id.to_string(),
            room_id.to_string(),
            user_id.to_string(),
            status.as_str(),
            now,
            if auto { Some(now) } else { None },
        ],
    )
    .map_err(|e| StoreError::storage("create_membership", e.to_string()))?;

    if tx.changes() == 0 {
        return Ok(MembershipCreateOutcome::Duplicate);
    }

    let row = MembershipRow {
        id: membership_id,
        room_id,
        user_id,
        role: MemberRole::Member,
        status,
        created_at: now,
        accepted_at: if auto { Some(now) } else { None },
        rejected_at: None,
    };

    let event_type = if auto {
        "membership.accepted"
    } else {
        "membership.requested"
    };
    outbox::append_sync(&tx, event_type, room_id, &membership_payload(&row), now)?;

    tx.commit()
        .map_err(|e| StoreError::storage("create_membership", e.to_string()))?;

    Ok(MembershipCreateOutcome::Created(row))
}

/// Admin decision on a pending membership.
pub(crate) fn resolve_membership_sync(
    conn: &mut Connection,
    room_id: Uuid,
    membership_id: Uuid,
    decided_by: Uuid,
    resolution: Resolution,
    now: i64,
) -> Result<MembershipResolveOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("resolve_membership", e.to_string()))?;

    if rooms::get_room_sync(&tx, room_id)?.is_none() {
        return Ok(MembershipResolveOutcome::NotFound);
    }
    if !is_admin_sync(&tx, room_id, decided_by)? {
        return Ok(MembershipResolveOutcome::NotAdmin);
    }

    // Scope check before the transition so a membership id from another
    // room reads as missing, not as resolvable.
    let belongs: Option<String> = tx
        .query_row(
            "SELECT room_id FROM memberships WHERE id = ?1",
            params![membership_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::storage("resolve_membership", e.to_string()))?;
    match belongs {
        None => return Ok(MembershipResolveOutcome::NotFound),
        Some(r) if r != room_id.to_string() => return Ok(MembershipResolveOutcome::NotFound),
        Some(_) => {}
    }

    let Some(raw) = try_transition_sync::<RawMembership>(&tx, membership_id, resolution, now)?
    else {
        let status = current_status_sync::<RawMembership>(&tx, membership_id)?
            .ok_or_else(|| StoreError::corruption("membership row"))?;
        return Ok(MembershipResolveOutcome::AlreadyResolved(status));
    };
    let row = raw.build()?;

    let event_type = match resolution {
        Resolution::Accepted => "membership.accepted",
        Resolution::Rejected => "membership.rejected",
    };
    outbox::append_sync(&tx, event_type, room_id, &membership_payload(&row), now)?;

    tx.commit()
        .map_err(|e| StoreError::storage("resolve_membership", e.to_string()))?;

    Ok(MembershipResolveOutcome::Resolved(row))
}

fn membership_payload(row: &MembershipRow) -> serde_json::Value {
    json!({
        "membership_id": row.id,
        "room_id": row.room_id,
        "user_id": row.user_id,
        "role": row.role,
        "status": row.status,
    })
}

pub(crate) fn is_accepted_member_sync(
    conn: &Connection,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM memberships
             WHERE room_id = ?1 AND user_id = ?2 AND status = 'ACCEPTED'",
            params![room_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::storage("is_accepted_member", e.to_string()))?;
    Ok(found.is_some())
}

pub(crate) fn is_admin_sync(
    conn: &Connection,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM memberships
             WHERE room_id = ?1 AND user_id = ?2
               AND role = 'admin' AND status = 'ACCEPTED'",
            params![room_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::storage("is_admin", e.to_string()))?;
    Ok(found.is_some())
}

/// Count of ACCEPTED members, the denominator for percent thresholds.
pub(crate) fn count_accepted_members_sync(
    conn: &Connection,
    room_id: Uuid,
) -> Result<u32, StoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM memberships WHERE room_id = ?1 AND status = 'ACCEPTED'",
        params![room_id.to_string()],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::storage("count_accepted_members", e.to_string()))
}

impl SqliteStore {
    pub async fn create_membership(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> Result<MembershipCreateOutcome, StoreError> {
        self.call("create_membership", move |conn| {
            create_membership_sync(conn, room_id, user_id, now_secs())
        })
        .await
    }

    pub async fn resolve_membership(
        &self,
        room_id: Uuid,
        membership_id: Uuid,
        decided_by: Uuid,
        resolution: Resolution,
    ) -> Result<MembershipResolveOutcome, StoreError> {
        self.call("resolve_membership", move |conn| {
            resolve_membership_sync(conn, room_id, membership_id, decided_by, resolution, now_secs())
        })
        .await
    }

    pub async fn is_accepted_member(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, StoreError> {
        self.call("is_accepted_member", move |conn| {
            is_accepted_member_sync(conn, room_id, user_id)
        })
        .await
    }
}
