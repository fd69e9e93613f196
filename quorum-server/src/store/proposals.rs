//! Proposal storage, voting and auto-approval.
//!
//! A proposal is PENDING until either an admin resolves it or a vote pushes
//! it past the room's auto-approval threshold. Acceptance applies the
//! proposal: the accepted body is materialized as a room entry inside the
//! same transaction, so readers never observe an accepted-but-unapplied
//! proposal after commit.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::memberships::{count_accepted_members_sync, is_accepted_member_sync, is_admin_sync};
use super::rooms::{get_room_sync, RoomSettings};
use super::transition::{
    current_status_sync, try_transition_sync, Approvable, ApprovalStatus, Resolution,
};
use super::{now_secs, outbox, parse_uuid, SqliteStore};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalKind {
    Assumption,
    Criterion,
    Conclusion,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::Assumption => "assumption",
            ProposalKind::Criterion => "criterion",
            ProposalKind::Conclusion => "conclusion",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "assumption" => Some(ProposalKind::Assumption),
            "criterion" => Some(ProposalKind::Criterion),
            "conclusion" => Some(ProposalKind::Conclusion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub kind: ProposalKind,
    pub body: String,
    pub proposed_by: Uuid,
    pub status: ApprovalStatus,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
    pub rejected_at: Option<i64>,
    pub applied_at: Option<i64>,
}

struct RawProposal {
    id: String,
    room_id: String,
    kind: String,
    body: String,
    proposed_by: String,
    status: String,
    created_at: i64,
    accepted_at: Option<i64>,
    rejected_at: Option<i64>,
    applied_at: Option<i64>,
}

impl Approvable for RawProposal {
    const TABLE: &'static str = "proposals";
    const COLUMNS: &'static str = "id, room_id, kind, body, proposed_by, status, \
         created_at, accepted_at, rejected_at, applied_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawProposal {
            id: row.get(0)?,
            room_id: row.get(1)?,
            kind: row.get(2)?,
            body: row.get(3)?,
            proposed_by: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            accepted_at: row.get(7)?,
            rejected_at: row.get(8)?,
            applied_at: row.get(9)?,
        })
    }
}

impl RawProposal {
    fn build(self) -> Result<ProposalRow, StoreError> {
        Ok(ProposalRow {
            id: parse_uuid(&self.id, "proposal id")?,
            room_id: parse_uuid(&self.room_id, "proposal room_id")?,
            kind: ProposalKind::parse(&self.kind)
                .ok_or_else(|| StoreError::corruption("proposal kind"))?,
            body: self.body,
            proposed_by: parse_uuid(&self.proposed_by, "proposal proposed_by")?,
            status: ApprovalStatus::parse(&self.status)
                .ok_or_else(|| StoreError::corruption("proposal status"))?,
            created_at: self.created_at,
            accepted_at: self.accepted_at,
            rejected_at: self.rejected_at,
            applied_at: self.applied_at,
        })
    }
}

/// Whether `vote_count` crosses the room's auto-approval threshold for
/// `kind`.
///
/// Assumptions and criteria use an absolute minimum; conclusions use a
/// percentage of currently accepted members. A room with zero accepted
/// members never auto-approves a conclusion, whatever the percentage.
pub fn auto_approval_met(
    settings: &RoomSettings,
    kind: ProposalKind,
    vote_count: u32,
    accepted_members: u32,
) -> bool {
    match kind {
        ProposalKind::Assumption => settings
            .assumption_min_votes
            .is_some_and(|min| vote_count >= min),
        ProposalKind::Criterion => settings
            .criterion_min_votes
            .is_some_and(|min| vote_count >= min),
        ProposalKind::Conclusion => match settings.conclusion_threshold_percent {
            Some(percent) if accepted_members > 0 => {
                u64::from(vote_count) * 100 >= u64::from(percent) * u64::from(accepted_members)
            }
            _ => false,
        },
    }
}

#[derive(Debug)]
pub enum ProposalCreateOutcome {
    Created(ProposalRow),
    RoomNotFound,
    NotMember,
}

#[derive(Debug)]
pub enum ProposalResolveOutcome {
    Resolved(ProposalRow),
    AlreadyResolved(ApprovalStatus),
    NotFound,
    RoomNotFound,
    NotAdmin,
}

#[derive(Debug)]
pub enum VoteOutcome {
    /// Vote recorded. `accepted` carries the proposal when this vote
    /// crossed the threshold and auto-approved it.
    Cast {
        vote_count: u32,
        accepted: Option<ProposalRow>,
    },
    DuplicateVote,
    AlreadyResolved(ApprovalStatus),
    ProposalNotFound,
    NotMember,
}

#[derive(Debug)]
pub enum RetractOutcome {
    Retracted { vote_count: u32 },
    NoVote,
    AlreadyResolved(ApprovalStatus),
    ProposalNotFound,
    NotMember,
}

pub(crate) fn create_proposal_sync(
    conn: &mut Connection,
    room_id: Uuid,
    kind: ProposalKind,
    body: &str,
    proposed_by: Uuid,
    now: i64,
) -> Result<ProposalCreateOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("create_proposal", e.to_string()))?;

    if get_room_sync(&tx, room_id)?.is_none() {
        return Ok(ProposalCreateOutcome::RoomNotFound);
    }
    if !is_accepted_member_sync(&tx, room_id, proposed_by)? {
        return Ok(ProposalCreateOutcome::NotMember);
    }

    let row = ProposalRow {
        id: Uuid::new_v4(),
        room_id,
        kind,
        body: body.to_string(),
        proposed_by,
        status: ApprovalStatus::Pending,
        created_at: now,
        accepted_at: None,
        rejected_at: None,
        applied_at: None,
    };

    tx.execute(
        "INSERT INTO proposals (id, room_id, kind, body, proposed_by, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6)",
        params![
            row.id.to_string(),
            room_id.to_string(),
            kind.as_str(),
            body,
            proposed_by.to_string(),
            now
        ],
    )
    .map_err(|e| StoreError::storage("create_proposal", e.to_string()))?;

    outbox::append_sync(&tx, "proposal.created", room_id, &proposal_payload(&row), now)?;

    tx.commit()
        .map_err(|e| StoreError::storage("create_proposal", e.to_string()))?;

    Ok(ProposalCreateOutcome::Created(row))
}

/// Admin decision on a pending proposal. Acceptance applies it in the same
/// transaction.
pub(crate) fn resolve_proposal_sync(
    conn: &mut Connection,
    room_id: Uuid,
    proposal_id: Uuid,
    decided_by: Uuid,
    resolution: Resolution,
    now: i64,
) -> Result<ProposalResolveOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("resolve_proposal", e.to_string()))?;

    if get_room_sync(&tx, room_id)?.is_none() {
        return Ok(ProposalResolveOutcome::RoomNotFound);
    }
    if !is_admin_sync(&tx, room_id, decided_by)? {
        return Ok(ProposalResolveOutcome::NotAdmin);
    }
    if !proposal_in_room(&tx, proposal_id, room_id)? {
        return Ok(ProposalResolveOutcome::NotFound);
    }

    let Some(raw) = try_transition_sync::<RawProposal>(&tx, proposal_id, resolution, now)? else {
        let status = current_status_sync::<RawProposal>(&tx, proposal_id)?
            .ok_or_else(|| StoreError::corruption("proposal row"))?;
        return Ok(ProposalResolveOutcome::AlreadyResolved(status));
    };
    let mut row = raw.build()?;

    let event_type = match resolution {
        Resolution::Accepted => {
            apply_accepted_sync(&tx, &mut row, now)?;
            "proposal.accepted"
        }
        Resolution::Rejected => "proposal.rejected",
    };
    outbox::append_sync(&tx, event_type, room_id, &proposal_payload(&row), now)?;

    tx.commit()
        .map_err(|e| StoreError::storage("resolve_proposal", e.to_string()))?;

    Ok(ProposalResolveOutcome::Resolved(row))
}

/// Record a vote; auto-approve the proposal when the threshold is crossed.
pub(crate) fn cast_vote_sync(
    conn: &mut Connection,
    room_id: Uuid,
    proposal_id: Uuid,
    voter_id: Uuid,
    now: i64,
) -> Result<VoteOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("cast_vote", e.to_string()))?;

    let Some(room) = get_room_sync(&tx, room_id)? else {
        return Ok(VoteOutcome::ProposalNotFound);
    };
    if !is_accepted_member_sync(&tx, room_id, voter_id)? {
        return Ok(VoteOutcome::NotMember);
    }
    if !proposal_in_room(&tx, proposal_id, room_id)? {
        return Ok(VoteOutcome::ProposalNotFound);
    }
    match current_status_sync::<RawProposal>(&tx, proposal_id)? {
        Some(ApprovalStatus::Pending) => {}
        Some(status) => return Ok(VoteOutcome::AlreadyResolved(status)),
        None => return Ok(VoteOutcome::ProposalNotFound),
    }

    tx.execute(
        "INSERT OR IGNORE INTO votes (proposal_id, voter_id, created_at) VALUES (?1, ?2, ?3)",
        params![proposal_id.to_string(), voter_id.to_string(), now],
    )
    .map_err(|e| StoreError::storage("cast_vote", e.to_string()))?;
    if tx.changes() == 0 {
        return Ok(VoteOutcome::DuplicateVote);
    }

    let vote_count = count_votes_sync(&tx, proposal_id)?;
    // Payloads carry identifiers only; consumers needing the tally read it
    // from the proposal, not from the event.
    outbox::append_sync(
        &tx,
        "vote.cast",
        room_id,
        &json!({
            "proposal_id": proposal_id,
            "room_id": room_id,
            "voter_id": voter_id,
        }),
        now,
    )?;

    // Threshold evaluation and acceptance run in this same transaction, so
    // two concurrent threshold-crossing votes cannot both accept: the
    // guarded transition admits one winner.
    let kind = proposal_kind_sync(&tx, proposal_id)?;
    let members = count_accepted_members_sync(&tx, room_id)?;
    let mut accepted = None;
    if auto_approval_met(&room.settings, kind, vote_count, members) {
        if let Some(raw) =
            try_transition_sync::<RawProposal>(&tx, proposal_id, Resolution::Accepted, now)?
        {
            let mut row = raw.build()?;
            apply_accepted_sync(&tx, &mut row, now)?;
            outbox::append_sync(&tx, "proposal.accepted", room_id, &proposal_payload(&row), now)?;
            accepted = Some(row);
        }
    }

    tx.commit()
        .map_err(|e| StoreError::storage("cast_vote", e.to_string()))?;

    Ok(VoteOutcome::Cast {
        vote_count,
        accepted,
    })
}

/// Withdraw a vote from a still-pending proposal.
///
/// Retraction never reverses an acceptance: once resolved, the proposal is
/// immutable and the request conflicts.
pub(crate) fn retract_vote_sync(
    conn: &mut Connection,
    room_id: Uuid,
    proposal_id: Uuid,
    voter_id: Uuid,
    now: i64,
) -> Result<RetractOutcome, StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::storage("retract_vote", e.to_string()))?;

    if get_room_sync(&tx, room_id)?.is_none() {
        return Ok(RetractOutcome::ProposalNotFound);
    }
    if !is_accepted_member_sync(&tx, room_id, voter_id)? {
        return Ok(RetractOutcome::NotMember);
    }
    if !proposal_in_room(&tx, proposal_id, room_id)? {
        return Ok(RetractOutcome::ProposalNotFound);
    }
    match current_status_sync::<RawProposal>(&tx, proposal_id)? {
        Some(ApprovalStatus::Pending) => {}
        Some(status) => return Ok(RetractOutcome::AlreadyResolved(status)),
        None => return Ok(RetractOutcome::ProposalNotFound),
    }

    tx.execute(
        "DELETE FROM votes WHERE proposal_id = ?1 AND voter_id = ?2",
        params![proposal_id.to_string(), voter_id.to_string()],
    )
    .map_err(|e| StoreError::storage("retract_vote", e.to_string()))?;
    if tx.changes() == 0 {
        return Ok(RetractOutcome::NoVote);
    }

    let vote_count = count_votes_sync(&tx, proposal_id)?;
    outbox::append_sync(
        &tx,
        "vote.retracted",
        room_id,
        &json!({
            "proposal_id": proposal_id,
            "room_id": room_id,
            "voter_id": voter_id,
        }),
        now,
    )?;

    tx.commit()
        .map_err(|e| StoreError::storage("retract_vote", e.to_string()))?;

    Ok(RetractOutcome::Retracted { vote_count })
}

/// Materialize an accepted proposal as a room entry and stamp `applied_at`.
fn apply_accepted_sync(
    tx: &Transaction<'_>,
    row: &mut ProposalRow,
    now: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO room_entries (id, room_id, kind, body, proposal_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            row.room_id.to_string(),
            row.kind.as_str(),
            row.body,
            row.id.to_string(),
            now
        ],
    )
    .map_err(|e| StoreError::storage("apply_proposal", e.to_string()))?;

    tx.execute(
        "UPDATE proposals SET applied_at = ?1 WHERE id = ?2",
        params![now, row.id.to_string()],
    )
    .map_err(|e| StoreError::storage("apply_proposal", e.to_string()))?;

    row.applied_at = Some(now);
    Ok(())
}

fn proposal_in_room(
    conn: &Connection,
    proposal_id: Uuid,
    room_id: Uuid,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM proposals WHERE id = ?1 AND room_id = ?2",
            params![proposal_id.to_string(), room_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::storage("proposal lookup", e.to_string()))?;
    Ok(found.is_some())
}

fn proposal_kind_sync(conn: &Connection, proposal_id: Uuid) -> Result<ProposalKind, StoreError> {
    let kind: String = conn
        .query_row(
            "SELECT kind FROM proposals WHERE id = ?1",
            params![proposal_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::storage("proposal lookup", e.to_string()))?;
    ProposalKind::parse(&kind).ok_or_else(|| StoreError::corruption("proposal kind"))
}

pub(crate) fn count_votes_sync(conn: &Connection, proposal_id: Uuid) -> Result<u32, StoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM votes WHERE proposal_id = ?1",
        params![proposal_id.to_string()],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::storage("count_votes", e.to_string()))
}

fn proposal_payload(row: &ProposalRow) -> serde_json::Value {
    json!({
        "proposal_id": row.id,
        "room_id": row.room_id,
        "kind": row.kind,
        "body": row.body,
        "proposed_by": row.proposed_by,
        "status": row.status,
    })
}

impl SqliteStore {
    pub async fn create_proposal(
        &self,
        room_id: Uuid,
        kind: ProposalKind,
        body: String,
        proposed_by: Uuid,
    ) -> Result<ProposalCreateOutcome, StoreError> {
        self.call("create_proposal", move |conn| {
            create_proposal_sync(conn, room_id, kind, &body, proposed_by, now_secs())
        })
        .await
    }

    pub async fn resolve_proposal(
        &self,
        room_id: Uuid,
        proposal_id: Uuid,
        decided_by: Uuid,
        resolution: Resolution,
    ) -> Result<ProposalResolveOutcome, StoreError> {
        self.call("resolve_proposal", move |conn| {
            resolve_proposal_sync(conn, room_id, proposal_id, decided_by, resolution, now_secs())
        })
        .await
    }

    pub async fn cast_vote(
        &self,
        room_id: Uuid,
        proposal_id: Uuid,
        voter_id: Uuid,
    ) -> Result<VoteOutcome, StoreError> {
        self.call("cast_vote", move |conn| {
            cast_vote_sync(conn, room_id, proposal_id, voter_id, now_secs())
        })
        .await
    }

    pub async fn retract_vote(
        &self,
        room_id: Uuid,
        proposal_id: Uuid,
        voter_id: Uuid,
    ) -> Result<RetractOutcome, StoreError> {
        self.call("retract_vote", move |conn| {
            retract_vote_sync(conn, room_id, proposal_id, voter_id, now_secs())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memberships::{create_membership_sync, MembershipCreateOutcome};
    use crate::store::rooms::create_room_sync;
    use crate::store::test_connection;

    fn make_room(conn: &mut Connection, settings: RoomSettings) -> (Uuid, Uuid) {
        let admin = Uuid::new_v4();
        let room = create_room_sync(conn, "r", &settings, admin, 100).expect("create room");
        (room.id, admin)
    }

    fn add_member(conn: &mut Connection, room: Uuid) -> Uuid {
        let user = Uuid::new_v4();
        // Accepted directly via auto-approve semantics of the helper room,
        // or forced below.
        match create_membership_sync(conn, room, user, 100).expect("join") {
            MembershipCreateOutcome::Created(m) => {
                conn.execute(
                    "UPDATE memberships SET status = 'ACCEPTED', accepted_at = 100 WHERE id = ?1",
                    params![m.id.to_string()],
                )
                .expect("accept");
            }
            other => panic!("expected created, got {:?}", other),
        }
        user
    }

    fn pending_proposal(
        conn: &mut Connection,
        room: Uuid,
        kind: ProposalKind,
        by: Uuid,
    ) -> ProposalRow {
        match create_proposal_sync(conn, room, kind, "claim", by, 200).expect("create") {
            ProposalCreateOutcome::Created(p) => p,
            other => panic!("expected created, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_approval_thresholds() {
        let settings = RoomSettings {
            assumption_min_votes: Some(2),
            criterion_min_votes: None,
            conclusion_threshold_percent: Some(60),
            ..Default::default()
        };

        assert!(!auto_approval_met(&settings, ProposalKind::Assumption, 1, 5));
        assert!(auto_approval_met(&settings, ProposalKind::Assumption, 2, 5));

        // No threshold configured for criteria: never auto-approved.
        assert!(!auto_approval_met(&settings, ProposalKind::Criterion, 100, 5));

        // 60% of 5 members needs 3 votes.
        assert!(!auto_approval_met(&settings, ProposalKind::Conclusion, 2, 5));
        assert!(auto_approval_met(&settings, ProposalKind::Conclusion, 3, 5));

        // Zero members never approves a conclusion.
        assert!(!auto_approval_met(&settings, ProposalKind::Conclusion, 10, 0));
    }

    #[test]
    fn test_threshold_exact_boundary() {
        let settings = RoomSettings {
            conclusion_threshold_percent: Some(50),
            ..Default::default()
        };
        // 50% of 3 members is 1.5: two votes needed, one is not enough.
        assert!(!auto_approval_met(&settings, ProposalKind::Conclusion, 1, 3));
        assert!(auto_approval_met(&settings, ProposalKind::Conclusion, 2, 3));
    }

    #[test]
    fn test_create_requires_membership() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());

        assert!(matches!(
            create_proposal_sync(&mut conn, room, ProposalKind::Assumption, "x", Uuid::new_v4(), 200)
                .expect("create"),
            ProposalCreateOutcome::NotMember
        ));
        assert!(matches!(
            create_proposal_sync(&mut conn, room, ProposalKind::Assumption, "x", admin, 200)
                .expect("create"),
            ProposalCreateOutcome::Created(_)
        ));
    }

    #[test]
    fn test_admin_accept_applies_entry() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());
        let p = pending_proposal(&mut conn, room, ProposalKind::Criterion, admin);

        match resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Accepted, 300)
            .expect("resolve")
        {
            ProposalResolveOutcome::Resolved(row) => {
                assert_eq!(row.status, ApprovalStatus::Accepted);
                assert_eq!(row.accepted_at, Some(300));
                assert_eq!(row.applied_at, Some(300));
            }
            other => panic!("expected resolved, got {:?}", other),
        }

        let (kind, body): (String, String) = conn
            .query_row(
                "SELECT kind, body FROM room_entries WHERE proposal_id = ?1",
                params![p.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("entry should exist");
        assert_eq!(kind, "criterion");
        assert_eq!(body, "claim");
    }

    #[test]
    fn test_reject_does_not_apply() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Rejected, 300)
            .expect("resolve");

        let entries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM room_entries WHERE proposal_id = ?1",
                params![p.id.to_string()],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_exactly_one_resolution_wins() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        let first = resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Accepted, 300)
            .expect("resolve");
        let second = resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Rejected, 301)
            .expect("resolve");

        assert!(matches!(first, ProposalResolveOutcome::Resolved(_)));
        match second {
            ProposalResolveOutcome::AlreadyResolved(status) => {
                assert_eq!(status, ApprovalStatus::Accepted);
            }
            other => panic!("expected already resolved, got {:?}", other),
        }

        // Exactly one entry despite two resolution attempts.
        let entries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM room_entries WHERE proposal_id = ?1",
                params![p.id.to_string()],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_non_admin_cannot_resolve() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());
        let member = add_member(&mut conn, room);
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        assert!(matches!(
            resolve_proposal_sync(&mut conn, room, p.id, member, Resolution::Accepted, 300)
                .expect("resolve"),
            ProposalResolveOutcome::NotAdmin
        ));
    }

    #[test]
    fn test_vote_crossing_threshold_auto_accepts() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(2),
                ..Default::default()
            },
        );
        let alice = add_member(&mut conn, room);
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        match cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote") {
            VoteOutcome::Cast {
                vote_count,
                accepted,
            } => {
                assert_eq!(vote_count, 1);
                assert!(accepted.is_none());
            }
            other => panic!("expected cast, got {:?}", other),
        }

        match cast_vote_sync(&mut conn, room, p.id, alice, 301).expect("vote") {
            VoteOutcome::Cast {
                vote_count,
                accepted,
            } => {
                assert_eq!(vote_count, 2);
                let row = accepted.expect("threshold crossed");
                assert_eq!(row.status, ApprovalStatus::Accepted);
                assert_eq!(row.applied_at, Some(301));
            }
            other => panic!("expected cast, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(5),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        assert!(matches!(
            cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote"),
            VoteOutcome::Cast { vote_count: 1, .. }
        ));
        assert!(matches!(
            cast_vote_sync(&mut conn, room, p.id, admin, 301).expect("vote"),
            VoteOutcome::DuplicateVote
        ));
        assert_eq!(count_votes_sync(&conn, p.id).expect("count"), 1);
    }

    #[test]
    fn test_vote_on_resolved_proposal_conflicts() {
        let mut conn = test_connection();
        let (room, admin) = make_room(&mut conn, RoomSettings::default());
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);
        resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Rejected, 300)
            .expect("resolve");

        assert!(matches!(
            cast_vote_sync(&mut conn, room, p.id, admin, 301).expect("vote"),
            VoteOutcome::AlreadyResolved(ApprovalStatus::Rejected)
        ));
    }

    #[test]
    fn test_retract_vote() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(5),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote");
        assert!(matches!(
            retract_vote_sync(&mut conn, room, p.id, admin, 301).expect("retract"),
            RetractOutcome::Retracted { vote_count: 0 }
        ));
        assert!(matches!(
            retract_vote_sync(&mut conn, room, p.id, admin, 302).expect("retract"),
            RetractOutcome::NoVote
        ));
    }

    #[test]
    fn test_retraction_never_unaccepts() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(1),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        // One vote auto-accepts at min_votes = 1.
        match cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote") {
            VoteOutcome::Cast { accepted, .. } => assert!(accepted.is_some()),
            other => panic!("expected cast, got {:?}", other),
        }

        assert!(matches!(
            retract_vote_sync(&mut conn, room, p.id, admin, 301).expect("retract"),
            RetractOutcome::AlreadyResolved(ApprovalStatus::Accepted)
        ));
        assert_eq!(
            current_status_sync::<RawProposal>(&conn, p.id).expect("status"),
            Some(ApprovalStatus::Accepted)
        );
    }

    #[test]
    fn test_vote_event_payloads_carry_identifiers_only() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(5),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote");
        retract_vote_sync(&mut conn, room, p.id, admin, 301).expect("retract");

        let events = outbox::poll_after_sync(&conn, room, 0, 100).expect("poll");
        for event_type in ["vote.cast", "vote.retracted"] {
            let event = events
                .iter()
                .find(|e| e.event_type == event_type)
                .unwrap_or_else(|| panic!("missing {} event", event_type));
            let payload = event.payload.as_object().expect("object payload");
            let mut keys: Vec<&str> = payload.keys().map(String::as_str).collect();
            keys.sort_unstable();
            assert_eq!(keys, vec!["proposal_id", "room_id", "voter_id"]);
        }
    }

    #[test]
    fn test_manual_resolution_after_auto_accept_conflicts() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(1),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);

        match cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote") {
            VoteOutcome::Cast { accepted, .. } => assert!(accepted.is_some()),
            other => panic!("expected cast, got {:?}", other),
        }

        // An admin rejection racing the auto-accept loses the transition.
        match resolve_proposal_sync(&mut conn, room, p.id, admin, Resolution::Rejected, 301)
            .expect("resolve")
        {
            ProposalResolveOutcome::AlreadyResolved(status) => {
                assert_eq!(status, ApprovalStatus::Accepted);
            }
            other => panic!("expected already resolved, got {:?}", other),
        }

        let entries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM room_entries WHERE proposal_id = ?1",
                params![p.id.to_string()],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_lifecycle_emits_ordered_events() {
        let mut conn = test_connection();
        let (room, admin) = make_room(
            &mut conn,
            RoomSettings {
                assumption_min_votes: Some(1),
                ..Default::default()
            },
        );
        let p = pending_proposal(&mut conn, room, ProposalKind::Assumption, admin);
        cast_vote_sync(&mut conn, room, p.id, admin, 300).expect("vote");

        let events = outbox::poll_after_sync(&conn, room, 0, 100).expect("poll");
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["proposal.created", "vote.cast", "proposal.accepted"]);
    }
}
