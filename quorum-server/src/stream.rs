//! Cursor-based SSE event stream.
//!
//! The stream tails a room's outbox rows by id. The outbox id is the SSE
//! event id, so a reconnecting client can resume exactly where it left off
//! with `Last-Event-ID`. Nothing is held in memory between polls; every
//! batch is read straight from the database, which is what makes resumption
//! after a server restart trivial.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::store::outbox::OutboxEventRow;
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct StreamService {
    store: Arc<SqliteStore>,
    poll_interval: Duration,
    batch_limit: usize,
    heartbeat: Duration,
    retry: Duration,
}

struct PollState {
    cursor: i64,
    /// The retry directive is sent once, before any events.
    primed: bool,
}

impl StreamService {
    pub fn new(store: Arc<SqliteStore>, config: &Config) -> Self {
        StreamService {
            store,
            poll_interval: config.stream_poll_interval,
            batch_limit: config.stream_batch_limit,
            heartbeat: config.stream_heartbeat,
            retry: config.stream_retry,
        }
    }

    /// Open a stream of events for `room_id` strictly after `cursor`.
    ///
    /// Comment heartbeats keep idle connections alive through proxies; a
    /// transient poll failure is logged and retried rather than tearing
    /// the connection down.
    pub fn sse_response(
        &self,
        room_id: Uuid,
        cursor: i64,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        let batch_limit = self.batch_limit;
        let retry = self.retry;

        let state = PollState {
            cursor,
            primed: false,
        };

        let stream = stream::unfold(state, move |mut state| {
            let store = store.clone();
            async move {
                if !state.primed {
                    state.primed = true;
                    let frames: Vec<Result<Event, Infallible>> =
                        vec![Ok(Event::default().retry(retry))];
                    return Some((frames, state));
                }

                match store
                    .poll_events_after(room_id, state.cursor, batch_limit)
                    .await
                {
                    Ok(events) if !events.is_empty() => {
                        state.cursor = events.last().map(|e| e.id).unwrap_or(state.cursor);
                        let frames = events.into_iter().filter_map(to_frame).map(Ok).collect();
                        Some((frames, state))
                    }
                    Ok(_) => {
                        tokio::time::sleep(poll_interval).await;
                        Some((Vec::new(), state))
                    }
                    Err(e) => {
                        // Re-send the retry directive so a client that gives
                        // up on the ailing connection backs off properly.
                        warn!(%room_id, "event poll failed: {}", e);
                        tokio::time::sleep(poll_interval).await;
                        let frames: Vec<Result<Event, Infallible>> =
                            vec![Ok(Event::default().retry(retry))];
                        Some((frames, state))
                    }
                }
            }
        })
        .flat_map(stream::iter);

        Sse::new(stream).keep_alive(KeepAlive::new().interval(self.heartbeat).text("ping"))
    }
}

fn to_frame(row: OutboxEventRow) -> Option<Event> {
    match Event::default()
        .id(row.id.to_string())
        .event(row.event_type.clone())
        .json_data(&row.payload)
    {
        Ok(event) => Some(event),
        Err(e) => {
            // An unserializable payload would have failed on append; skip
            // rather than kill the stream.
            warn!(event_id = row.id, "failed to encode event frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use axum::response::IntoResponse;
    use futures_util::StreamExt as _;
    use serde_json::json;

    fn service(store: Arc<SqliteStore>) -> StreamService {
        StreamService {
            store,
            poll_interval: Duration::from_millis(5),
            batch_limit: 100,
            heartbeat: Duration::from_secs(30),
            retry: Duration::from_millis(5_000),
        }
    }

    /// Read body chunks until `frames` complete SSE frames have arrived.
    async fn read_frames(response: axum::response::Response, frames: usize) -> Vec<String> {
        let mut stream = response.into_body().into_data_stream();
        let mut buffer = String::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let complete = buffer.matches("\n\n").count();
                if complete >= frames {
                    return;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    _ => return,
                }
            }
        })
        .await
        .expect("frames should arrive before the timeout");

        buffer
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .take(frames)
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_retry_directive_then_event_frames() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        let room = Uuid::new_v4();
        store
            .call("seed", move |conn| {
                crate::store::outbox::append_sync(conn, "proposal.created", room, &json!({"proposal_id": "p1"}), 0)
            })
            .await
            .expect("seed");

        let response = service(store).sse_response(room, 0).into_response();
        let frames = read_frames(response, 2).await;

        assert!(frames[0].contains("retry: 5000"), "got: {}", frames[0]);
        assert!(frames[1].contains("id: 1"), "got: {}", frames[1]);
        assert!(frames[1].contains("event: proposal.created"), "got: {}", frames[1]);
        assert!(frames[1].contains(r#"data: {"proposal_id":"p1"}"#), "got: {}", frames[1]);
    }

    #[tokio::test]
    async fn test_poll_failure_emits_retry_directive() {
        let store = Arc::new(SqliteStore::new_in_memory().expect("store"));
        store
            .call("break", |conn| {
                conn.execute("DROP TABLE outbox_events", [])
                    .map_err(|e| StoreError::storage("break", e.to_string()))?;
                Ok(())
            })
            .await
            .expect("drop table");

        let response = service(store)
            .sse_response(Uuid::new_v4(), 0)
            .into_response();

        // One directive at connect, another after the failed poll.
        let frames = read_frames(response, 2).await;
        assert!(frames[0].contains("retry: 5000"));
        assert!(frames[1].contains("retry: 5000"));
    }
}
