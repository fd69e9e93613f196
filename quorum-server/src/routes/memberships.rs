use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{guarded, parse_body, require_user, to_json, AppState};
use crate::error::ApiError;
use crate::idempotency::GuardedResponse;
use crate::store::memberships::{MembershipCreateOutcome, MembershipResolveOutcome};
use crate::store::transition::Resolution;

/// Admin decision payload, shared with proposal resolution.
#[derive(Deserialize)]
pub(super) struct DecisionBody {
    pub status: Decision,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(super) enum Decision {
    Accepted,
    Rejected,
}

impl Decision {
    pub fn resolution(self) -> Resolution {
        match self {
            Decision::Accepted => Resolution::Accepted,
            Decision::Rejected => Resolution::Rejected,
        }
    }
}

pub(super) async fn join_room(
    State(state): State<AppState>,
    Path(room): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let path = format!("/rooms/{}/memberships", room);

    guarded(&state, user, &headers, "POST", &path, &body, || async {
        match state.store.create_membership(room, user).await? {
            MembershipCreateOutcome::Created(m) => Ok(GuardedResponse::new(201, to_json(&m)?)),
            MembershipCreateOutcome::RoomNotFound => Err(ApiError::not_found(
                "Room not found",
                format!("No room with id {}", room),
            )),
            MembershipCreateOutcome::Duplicate => Err(ApiError::conflict(
                "Already a member",
                "A membership for this user already exists in the room",
            )),
        }
    })
    .await
}

pub(super) async fn resolve_membership(
    State(state): State<AppState>,
    Path((room, membership)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let path = format!("/rooms/{}/memberships/{}/status", room, membership);

    guarded(&state, user, &headers, "POST", &path, &body, || async {
        let request: DecisionBody = parse_body(&body)?;
        match state
            .store
            .resolve_membership(room, membership, user, request.status.resolution())
            .await?
        {
            MembershipResolveOutcome::Resolved(m) => Ok(GuardedResponse::new(200, to_json(&m)?)),
            MembershipResolveOutcome::AlreadyResolved(status) => Err(ApiError::conflict(
                "Membership already resolved",
                format!("The membership is already {}", status.as_str()),
            )),
            MembershipResolveOutcome::NotFound => Err(ApiError::not_found(
                "Membership not found",
                format!("No membership {} in room {}", membership, room),
            )),
            MembershipResolveOutcome::NotAdmin => Err(ApiError::forbidden(
                "Admin required",
                "Only an accepted admin of the room can resolve memberships",
            )),
        }
    })
    .await
}
