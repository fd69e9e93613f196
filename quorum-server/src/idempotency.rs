//! Request-level idempotency guard.
//!
//! Wraps a mutating handler so that retries of the same logical request
//! (same owner, same key, same fingerprint) return the stored response
//! instead of re-executing the mutation. Key reuse with a different request
//! body is a client bug and is rejected outright.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::idempotency::AcquireOutcome;
use crate::store::SqliteStore;

/// A handler response captured for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedResponse {
    pub status: u16,
    pub body: Value,
    /// True when this response was served from a stored record rather than
    /// by executing the handler.
    pub replayed: bool,
}

impl GuardedResponse {
    pub fn new(status: u16, body: Value) -> Self {
        GuardedResponse {
            status,
            body,
            replayed: false,
        }
    }
}

/// Fields stripped before fingerprinting. These are server-assigned or
/// clock-derived and legitimately differ between retries of one logical
/// request.
const VOLATILE_FIELDS: [&str; 4] = ["id", "timestamp", "created_at", "updated_at"];

/// Compute the semantic fingerprint of a request.
///
/// The body is normalized by dropping volatile fields at every nesting
/// level; serde_json's default map representation is ordered, so
/// serializing the normalized value yields a canonical sorted-key form.
pub fn fingerprint(method: &str, path: &str, body: &Value) -> String {
    let normalized = normalize(body);
    let canonical = normalized.to_string();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Guards mutating operations with at-most-once execution per
/// `(owner, key)` within the replay window.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<SqliteStore>,
    ttl_secs: i64,
    stale_secs: i64,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<SqliteStore>, ttl_secs: i64, stale_secs: i64) -> Self {
        IdempotencyGuard {
            store,
            ttl_secs,
            stale_secs,
        }
    }

    /// Execute `handler` at most once for this `(owner, key)` pair.
    ///
    /// - first call: runs the handler, stores the response, returns it
    /// - retry after completion: returns the stored response, handler not run
    /// - concurrent duplicate: 409 without waiting for the first to finish
    /// - key reuse with a different request: 409
    ///
    /// A handler error releases the claim so the client can retry with the
    /// same key.
    pub async fn execute<F, Fut>(
        &self,
        owner: Uuid,
        key: &str,
        method: &str,
        path: &str,
        body: &Value,
        handler: F,
    ) -> Result<GuardedResponse, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GuardedResponse, ApiError>>,
    {
        let fp = fingerprint(method, path, body);

        let outcome = self
            .store
            .try_acquire_idempotency(owner, key, method, path, &fp, self.ttl_secs, self.stale_secs)
            .await?;

        match outcome {
            AcquireOutcome::Acquired => match handler().await {
                Ok(response) => {
                    self.store
                        .complete_idempotency(owner, key, response.status, response.body.clone())
                        .await?;
                    Ok(response)
                }
                Err(e) => {
                    // Best effort: if the release itself fails the claim
                    // goes stale and is reclaimed later.
                    if let Err(release_err) = self.store.release_idempotency(owner, key).await {
                        debug!("failed to release idempotency claim: {}", release_err);
                    }
                    Err(e)
                }
            },
            AcquireOutcome::Replay { status, body } => {
                debug!(%owner, key, "replaying stored idempotent response");
                Ok(GuardedResponse {
                    status,
                    body,
                    replayed: true,
                })
            }
            AcquireOutcome::InProgress => Err(ApiError::conflict(
                "Request already in progress",
                format!(
                    "Another request with idempotency key '{}' is currently executing",
                    key
                ),
            )),
            AcquireOutcome::FingerprintMismatch => Err(ApiError::conflict(
                "Idempotency key reused",
                format!(
                    "Idempotency key '{}' was already used for a different request",
                    key
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"title": "t", "kind": "assumption"});
        let b = json!({"kind": "assumption", "title": "t"});
        assert_eq!(fingerprint("POST", "/p", &a), fingerprint("POST", "/p", &b));
    }

    #[test]
    fn test_fingerprint_ignores_volatile_fields() {
        let a = json!({"title": "t", "id": "x1", "created_at": 5});
        let b = json!({"title": "t", "id": "x2", "created_at": 9});
        assert_eq!(fingerprint("POST", "/p", &a), fingerprint("POST", "/p", &b));
    }

    #[test]
    fn test_fingerprint_strips_nested_volatile_fields() {
        let a = json!({"items": [{"body": "x", "timestamp": 1}]});
        let b = json!({"items": [{"body": "x", "timestamp": 2}]});
        assert_eq!(fingerprint("POST", "/p", &a), fingerprint("POST", "/p", &b));
    }

    #[test]
    fn test_fingerprint_distinguishes_method_path_body() {
        let body = json!({"title": "t"});
        let base = fingerprint("POST", "/p", &body);
        assert_ne!(base, fingerprint("PUT", "/p", &body));
        assert_ne!(base, fingerprint("POST", "/q", &body));
        assert_ne!(base, fingerprint("POST", "/p", &json!({"title": "u"})));
    }

    fn guard() -> IdempotencyGuard {
        let store = Arc::new(SqliteStore::new_in_memory().expect("should create store"));
        IdempotencyGuard::new(store, 86_400, 900)
    }

    #[tokio::test]
    async fn test_first_call_executes_handler() {
        let guard = guard();
        let owner = Uuid::new_v4();
        let body = json!({"title": "t"});

        let response = guard
            .execute(owner, "k1", "POST", "/rooms", &body, || async {
                Ok(GuardedResponse::new(201, json!({"ok": true})))
            })
            .await
            .expect("should succeed");

        assert_eq!(response.status, 201);
        assert!(!response.replayed);
    }

    #[tokio::test]
    async fn test_retry_replays_without_reexecuting() {
        let guard = guard();
        let owner = Uuid::new_v4();
        let body = json!({"title": "t"});

        guard
            .execute(owner, "k1", "POST", "/rooms", &body, || async {
                Ok(GuardedResponse::new(201, json!({"n": 1})))
            })
            .await
            .expect("first call should succeed");

        let replay = guard
            .execute(owner, "k1", "POST", "/rooms", &body, || async {
                panic!("handler must not run on replay")
            })
            .await
            .expect("replay should succeed");

        assert_eq!(replay.status, 201);
        assert_eq!(replay.body, json!({"n": 1}));
        assert!(replay.replayed);
    }

    #[tokio::test]
    async fn test_key_reuse_with_different_body_conflicts() {
        let guard = guard();
        let owner = Uuid::new_v4();

        guard
            .execute(owner, "k1", "POST", "/rooms", &json!({"title": "a"}), || async {
                Ok(GuardedResponse::new(201, json!({})))
            })
            .await
            .expect("first call should succeed");

        let err = guard
            .execute(owner, "k1", "POST", "/rooms", &json!({"title": "b"}), || async {
                Ok(GuardedResponse::new(201, json!({})))
            })
            .await
            .expect_err("reuse should conflict");

        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_handler_error_releases_claim() {
        let guard = guard();
        let owner = Uuid::new_v4();
        let body = json!({"title": "t"});

        let err = guard
            .execute(owner, "k1", "POST", "/rooms", &body, || async {
                Err(ApiError::validation("Bad input", "title empty"))
            })
            .await
            .expect_err("handler error should propagate");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        // Key is retryable after the failure.
        let response = guard
            .execute(owner, "k1", "POST", "/rooms", &body, || async {
                Ok(GuardedResponse::new(201, json!({"retried": true})))
            })
            .await
            .expect("retry should succeed");
        assert!(!response.replayed);
        assert_eq!(response.body, json!({"retried": true}));
    }
}
