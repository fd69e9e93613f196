use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::memberships::DecisionBody;
use super::{guarded, parse_body, require_user, to_json, AppState};
use crate::error::ApiError;
use crate::idempotency::GuardedResponse;
use crate::store::proposals::{
    ProposalCreateOutcome, ProposalKind, ProposalResolveOutcome, RetractOutcome, VoteOutcome,
};

#[derive(Deserialize)]
struct CreateProposalBody {
    kind: ProposalKind,
    body: String,
}

pub(super) async fn create_proposal(
    State(state): State<AppState>,
    Path(room): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let path = format!("/rooms/{}/proposals", room);

    guarded(&state, user, &headers, "POST", &path, &body, || async {
        let request: CreateProposalBody = parse_body(&body)?;
        if request.body.trim().is_empty() {
            return Err(ApiError::validation("Invalid body", "body must not be empty"));
        }

        match state
            .store
            .create_proposal(room, request.kind, request.body, user)
            .await?
        {
            ProposalCreateOutcome::Created(p) => Ok(GuardedResponse::new(201, to_json(&p)?)),
            ProposalCreateOutcome::RoomNotFound => Err(ApiError::not_found(
                "Room not found",
                format!("No room with id {}", room),
            )),
            ProposalCreateOutcome::NotMember => Err(ApiError::forbidden(
                "Membership required",
                "Only accepted members of the room can propose",
            )),
        }
    })
    .await
}

pub(super) async fn resolve_proposal(
    State(state): State<AppState>,
    Path((room, proposal)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let path = format!("/rooms/{}/proposals/{}/status", room, proposal);

    guarded(&state, user, &headers, "POST", &path, &body, || async {
        let request: DecisionBody = parse_body(&body)?;
        match state
            .store
            .resolve_proposal(room, proposal, user, request.status.resolution())
            .await?
        {
            ProposalResolveOutcome::Resolved(p) => Ok(GuardedResponse::new(200, to_json(&p)?)),
            ProposalResolveOutcome::AlreadyResolved(status) => Err(ApiError::conflict(
                "Proposal already resolved",
                format!("The proposal is already {}", status.as_str()),
            )),
            ProposalResolveOutcome::NotFound => Err(ApiError::not_found(
                "Proposal not found",
                format!("No proposal {} in room {}", proposal, room),
            )),
            ProposalResolveOutcome::RoomNotFound => Err(ApiError::not_found(
                "Room not found",
                format!("No room with id {}", room),
            )),
            ProposalResolveOutcome::NotAdmin => Err(ApiError::forbidden(
                "Admin required",
                "Only an accepted admin of the room can resolve proposals",
            )),
        }
    })
    .await
}

pub(super) async fn cast_vote(
    State(state): State<AppState>,
    Path((room, proposal)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let path = format!("/rooms/{}/proposals/{}/vote", room, proposal);

    guarded(&state, user, &headers, "PUT", &path, &body, || async {
        match state.store.cast_vote(room, proposal, user).await? {
            VoteOutcome::Cast {
                vote_count,
                accepted,
            } => Ok(GuardedResponse::new(
                200,
                json!({
                    "proposal_id": proposal,
                    "vote_count": vote_count,
                    "accepted": accepted.map(|p| to_json(&p)).transpose()?,
                }),
            )),
            VoteOutcome::DuplicateVote => Err(ApiError::conflict(
                "Already voted",
                "This member has already voted on the proposal",
            )),
            VoteOutcome::AlreadyResolved(status) => Err(ApiError::conflict(
                "Proposal already resolved",
                format!("The proposal is already {}", status.as_str()),
            )),
            VoteOutcome::ProposalNotFound => Err(ApiError::not_found(
                "Proposal not found",
                format!("No proposal {} in room {}", proposal, room),
            )),
            VoteOutcome::NotMember => Err(ApiError::forbidden(
                "Membership required",
                "Only accepted members of the room can vote",
            )),
        }
    })
    .await
}

pub(super) async fn retract_vote(
    State(state): State<AppState>,
    Path((room, proposal)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let path = format!("/rooms/{}/proposals/{}/vote", room, proposal);

    guarded(&state, user, &headers, "DELETE", &path, &body, || async {
        match state.store.retract_vote(room, proposal, user).await? {
            RetractOutcome::Retracted { vote_count } => Ok(GuardedResponse::new(
                200,
                json!({
                    "proposal_id": proposal,
                    "vote_count": vote_count,
                }),
            )),
            RetractOutcome::NoVote => Err(ApiError::not_found(
                "Vote not found",
                "This member has no vote on the proposal",
            )),
            RetractOutcome::AlreadyResolved(status) => Err(ApiError::conflict(
                "Proposal already resolved",
                format!("The proposal is already {}", status.as_str()),
            )),
            RetractOutcome::ProposalNotFound => Err(ApiError::not_found(
                "Proposal not found",
                format!("No proposal {} in room {}", proposal, room),
            )),
            RetractOutcome::NotMember => Err(ApiError::forbidden(
                "Membership required",
                "Only accepted members of the room can vote",
            )),
        }
    })
    .await
}
