use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use super::{require_user, AppState};
use crate::error::ApiError;

#[derive(Deserialize, Default)]
pub(super) struct StreamQuery {
    last_event_id: Option<i64>,
}

/// Open an SSE stream of the room's events.
///
/// The resume position comes from `Last-Event-ID` when the browser
/// reconnects automatically, falling back to the `last_event_id` query
/// parameter for explicit resumption. Header wins when both are present.
pub(super) async fn room_stream(
    State(state): State<AppState>,
    Path(room): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&headers)?;

    if state.store.get_room(room).await?.is_none() {
        return Err(ApiError::not_found(
            "Room not found",
            format!("No room with id {}", room),
        ));
    }
    if !state.store.is_accepted_member(room, user).await? {
        return Err(ApiError::forbidden(
            "Membership required",
            "Only accepted members of the room can subscribe to its events",
        ));
    }

    let header_cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let cursor = header_cursor.or(query.last_event_id).unwrap_or(0);

    Ok(state.streams.sse_response(room, cursor))
}
