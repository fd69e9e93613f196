//! Consistency and delivery layer for a collaborative decision backend.
//!
//! Rooms collect proposals; members vote; proposals resolve exactly once,
//! either by admin decision or by crossing the room's auto-approval
//! threshold. Every mutation is idempotent, every resolution emits an
//! outbox event, and clients follow a room over a resumable SSE stream.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod routes;
pub mod store;
pub mod stream;

pub use config::Config;
pub use routes::{router, AppState};
pub use store::SqliteStore;
