//! Room storage.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{now_secs, parse_uuid, SqliteStore};
use crate::error::StoreError;

/// Per-room auto-approval policy.
///
/// A `None` threshold means the corresponding proposal kind is only ever
/// resolved by an admin decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomSettings {
    #[serde(default)]
    pub assumption_min_votes: Option<u32>,
    #[serde(default)]
    pub criterion_min_votes: Option<u32>,
    /// Percent of accepted members (1-100) whose votes accept a conclusion.
    #[serde(default)]
    pub conclusion_threshold_percent: Option<u32>,
    /// Accept new memberships immediately instead of leaving them PENDING
    /// for an admin.
    #[serde(default)]
    pub auto_approve_memberships: bool,
}

impl RoomSettings {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.conclusion_threshold_percent {
            if !(1..=100).contains(&p) {
                return Err(format!(
                    "conclusion_threshold_percent must be between 1 and 100, got {}",
                    p
                ));
            }
        }
        if self.assumption_min_votes == Some(0) || self.criterion_min_votes == Some(0) {
            return Err("minimum vote thresholds must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomRow {
    pub id: Uuid,
    pub title: String,
    pub created_by: Uuid,
    pub created_at: i64,
    #[serde(flatten)]
    pub settings: RoomSettings,
}

impl RoomRow {
    const COLUMNS: &'static str = "id, title, created_by, created_at, \
         assumption_min_votes, criterion_min_votes, conclusion_threshold_percent, \
         auto_approve_memberships";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, RoomSettings)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            RoomSettings {
                assumption_min_votes: row.get(4)?,
                criterion_min_votes: row.get(5)?,
                conclusion_threshold_percent: row.get(6)?,
                auto_approve_memberships: row.get(7)?,
            },
        ))
    }

    fn build(raw: (String, String, String, i64, RoomSettings)) -> Result<Self, StoreError> {
        Ok(RoomRow {
            id: parse_uuid(&raw.0, "room id")?,
            title: raw.1,
            created_by: parse_uuid(&raw.2, "room created_by")?,
            created_at: raw.3,
            settings: raw.4,
        })
    }
}

/// Create a room and its creator's admin membership in one transaction.
pub(crate) fn create_room_sync(
    conn: &mut Connection,
    title: &str,
    settings: &RoomSettings,
    created_by: Uuid,
    now: i64,
) -> Result<RoomRow, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("create_room", e.to_string()))?;

    let room_id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO rooms (id, title, created_by, created_at,
             auto_approve_assumptions, assumption_min_votes,
             auto_approve_criteria, criterion_min_votes,
             auto_approve_conclusions, conclusion_threshold_percent,
             auto_approve_memberships)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            room_id.to_string(),
            title,
            created_by.to_string(),
            now,
            settings.assumption_min_votes.is_some(),
            settings.assumption_min_votes,
            settings.criterion_min_votes.is_some(),
            settings.criterion_min_votes,
            settings.conclusion_threshold_percent.is_some(),
            settings.conclusion_threshold_percent,
            settings.auto_approve_memberships,
        ],
    )
    .map_err(|e| StoreError::storage("create_room", e.to_string()))?;

    // The creator joins as an accepted admin immediately; a room with no
    // admin could never resolve anything.
    tx.execute(
        "INSERT INTO memberships (id, room_id, user_id, role, status, created_at, accepted_at)
         VALUES (?1, ?2, ?3, 'admin', 'ACCEPTED', ?4, ?4)",
        params![
            Uuid::new_v4().to_string(),
            room_id.to_string(),
            created_by.to_string(),
            now
        ],
    )
    .map_err(|e| StoreError::storage("create_room membership", e.to_string()))?;

    tx.commit()
        .map_err(|e| StoreError::storage("create_room", e.to_string()))?;

    Ok(RoomRow {
        id: room_id,
        title: title.to_string(),
        created_by,
        created_at: now,
        settings: settings.clone(),
    })
}

pub(crate) fn get_room_sync(
    conn: &Connection,
    room_id: Uuid,
) -> Result<Option<RoomRow>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM rooms WHERE id = ?1", RoomRow::COLUMNS),
            params![room_id.to_string()],
            RoomRow::from_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get_room", e.to_string()))?;

    raw.map(RoomRow::build).transpose()
}

impl SqliteStore {
    pub async fn create_room(
        &self,
        title: String,
        settings: RoomSettings,
        created_by: Uuid,
    ) -> Result<RoomRow, StoreError> {
        self.call("create_room", move |conn| {
            create_room_sync(conn, &title, &settings, created_by, now_secs())
        })
        .await
    }

    pub async fn get_room(&self, room_id: Uuid) -> Result<Option<RoomRow>, StoreError> {
        self.call("get_room", move |conn| get_room_sync(conn, room_id))
            .await
    }
}
