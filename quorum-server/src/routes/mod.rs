//! HTTP surface.
//!
//! Mutating routes run through the idempotency guard whenever the request
//! carries a key; the handlers themselves return `GuardedResponse` values
//! so a replay is byte-identical to the original response.

mod memberships;
mod proposals;
mod rooms;
mod stream;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;
use crate::idempotency::{GuardedResponse, IdempotencyGuard};
use crate::store::SqliteStore;
use crate::stream::StreamService;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub guard: IdempotencyGuard,
    pub streams: StreamService,
    pub development: bool,
}

impl AppState {
    pub fn new(store: Arc<SqliteStore>, config: &Config) -> Self {
        AppState {
            guard: IdempotencyGuard::new(
                store.clone(),
                config.idempotency_ttl_secs,
                config.idempotency_stale_secs,
            ),
            streams: StreamService::new(store.clone(), config),
            store,
            development: config.development,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/:room/memberships", post(memberships::join_room))
        .route(
            "/rooms/:room/memberships/:membership/status",
            post(memberships::resolve_membership),
        )
        .route("/rooms/:room/proposals", post(proposals::create_proposal))
        .route(
            "/rooms/:room/proposals/:proposal/status",
            post(proposals::resolve_proposal),
        )
        .route(
            "/rooms/:room/proposals/:proposal/vote",
            put(proposals::cast_vote).delete(proposals::retract_vote),
        )
        .route("/rooms/:room/stream", get(stream::room_stream))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    // A cheap read proves the database is reachable.
    state.store.get_room(Uuid::nil()).await?;
    Ok(Json(json!({"status": "ok"})))
}

/// Caller identity from the `X-User-Id` header.
pub(crate) fn require_user(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::unauthorized("Missing identity", "The X-User-Id header is required")
        })?;
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::unauthorized("Invalid identity", "The X-User-Id header must be a UUID")
    })
}

/// Idempotency key from the `Idempotency-Key` header.
///
/// The header is optional: without it the mutation runs unguarded.
/// Development generates a key so manual curl testing gets replay semantics
/// for free.
pub(crate) fn idempotency_key(headers: &HeaderMap, development: bool) -> Option<String> {
    match headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        Some(key) if !key.trim().is_empty() => Some(key.to_string()),
        _ if development => Some(Uuid::new_v4().to_string()),
        _ => None,
    }
}

/// Run a mutating handler, through the idempotency guard when the request
/// carries (or development mode supplies) a key.
pub(crate) async fn guarded<F, Fut>(
    state: &AppState,
    user: Uuid,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &serde_json::Value,
    handler: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<GuardedResponse, ApiError>>,
{
    let response = match idempotency_key(headers, state.development) {
        Some(key) => {
            state
                .guard
                .execute(user, &key, method, path, body, handler)
                .await?
        }
        None => handler().await?,
    };
    Ok(render(response))
}

/// Render a guarded response, flagging replays in a header.
pub(crate) fn render(response: GuardedResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut rendered = (status, Json(response.body)).into_response();
    if response.replayed {
        rendered
            .headers_mut()
            .insert("idempotency-replayed", HeaderValue::from_static("true"));
    }
    rendered
}

/// Deserialize a typed request out of the raw JSON body.
///
/// Handlers receive the body as `Value` because the idempotency fingerprint
/// is computed over the raw JSON before any typing is applied.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    body: &serde_json::Value,
) -> Result<T, ApiError> {
    serde_json::from_value(body.clone())
        .map_err(|e| ApiError::validation("Invalid request body", e.to_string()))
}

/// Serialize a response payload, mapping failure to a 500.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| {
        ApiError::Infrastructure(crate::error::StoreError::storage(
            "serialize response",
            e.to_string(),
        ))
    })
}
