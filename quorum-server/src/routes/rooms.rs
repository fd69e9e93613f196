use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use super::{guarded, parse_body, require_user, to_json, AppState};
use crate::error::ApiError;
use crate::idempotency::GuardedResponse;
use crate::store::rooms::RoomSettings;

#[derive(Deserialize)]
struct CreateRoomBody {
    title: String,
    #[serde(default)]
    settings: RoomSettings,
}

pub(super) async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;

    guarded(&state, user, &headers, "POST", "/rooms", &body, || async {
        let request: CreateRoomBody = parse_body(&body)?;
        if request.title.trim().is_empty() {
            return Err(ApiError::validation("Invalid title", "title must not be empty"));
        }
        if let Err(detail) = request.settings.validate() {
            return Err(ApiError::validation("Invalid settings", detail));
        }

        let room = state
            .store
            .create_room(request.title, request.settings, user)
            .await?;
        Ok(GuardedResponse::new(201, to_json(&room)?))
    })
    .await
}
