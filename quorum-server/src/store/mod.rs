//! SQLite persistence layer.
//!
//! A single `rusqlite::Connection` behind a mutex, with every operation run
//! through `tokio::task::spawn_blocking`. All multi-step mutations (business
//! write + conditional transition + outbox append) execute inside one
//! rusqlite transaction in a single blocking closure, so commit/rollback
//! atomicity never spans an await point.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and
//! add a migration in `run_migrations()`. Migrations run sequentially from
//! the current version to the target version.

pub mod idempotency;
pub mod memberships;
pub mod outbox;
pub mod proposals;
pub mod rooms;
pub mod transition;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::StoreError;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store for rooms, approvables, idempotency records and the
/// transactional outbox.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new store at the given path.
    ///
    /// Creates the database file and schema if they don't exist, and runs
    /// pending migrations otherwise.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();

        let path_str = path_ref.to_string_lossy();
        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // WAL must actually be enabled - SQLite can silently keep DELETE
        // mode on filesystems without shared-memory support, which would
        // break the concurrency assumptions of the conditional-update
        // claims. In-memory databases report "memory", which is fine.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Migration from version 0 (fresh database) to version 1
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS rooms (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    auto_approve_assumptions INTEGER NOT NULL DEFAULT 0,
                    assumption_min_votes INTEGER,
                    auto_approve_criteria INTEGER NOT NULL DEFAULT 0,
                    criterion_min_votes INTEGER,
                    auto_approve_conclusions INTEGER NOT NULL DEFAULT 0,
                    conclusion_threshold_percent INTEGER,
                    auto_approve_memberships INTEGER NOT NULL DEFAULT 0,
                    CHECK (auto_approve_assumptions = 0 OR assumption_min_votes IS NOT NULL),
                    CHECK (auto_approve_criteria = 0 OR criterion_min_votes IS NOT NULL),
                    CHECK (auto_approve_conclusions = 0 OR conclusion_threshold_percent IS NOT NULL),
                    CHECK (conclusion_threshold_percent IS NULL
                           OR conclusion_threshold_percent BETWEEN 1 AND 100)
                );

                CREATE TABLE IF NOT EXISTS memberships (
                    id TEXT PRIMARY KEY,
                    room_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('member', 'admin')),
                    status TEXT NOT NULL CHECK (status IN ('PENDING', 'ACCEPTED', 'REJECTED')),
                    created_at INTEGER NOT NULL,
                    accepted_at INTEGER,
                    rejected_at INTEGER,
                    UNIQUE (room_id, user_id)
                );
                CREATE INDEX IF NOT EXISTS idx_memberships_room
                    ON memberships(room_id, status);

                CREATE TABLE IF NOT EXISTS proposals (
                    id TEXT PRIMARY KEY,
                    room_id TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('assumption', 'criterion', 'conclusion')),
                    body TEXT NOT NULL,
                    proposed_by TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('PENDING', 'ACCEPTED', 'REJECTED')),
                    created_at INTEGER NOT NULL,
                    accepted_at INTEGER,
                    rejected_at INTEGER,
                    applied_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_proposals_room
                    ON proposals(room_id, status);

                CREATE TABLE IF NOT EXISTS room_entries (
                    id TEXT PRIMARY KEY,
                    room_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    body TEXT NOT NULL,
                    proposal_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_room_entries_room
                    ON room_entries(room_id, kind);

                CREATE TABLE IF NOT EXISTS votes (
                    proposal_id TEXT NOT NULL,
                    voter_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (proposal_id, voter_id)
                );

                CREATE TABLE IF NOT EXISTS idempotency_records (
                    owner_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    method TEXT NOT NULL,
                    path TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('IN_PROGRESS', 'COMPLETED')),
                    response_status INTEGER,
                    response_body TEXT,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (owner_id, key)
                );
                CREATE INDEX IF NOT EXISTS idx_idempotency_expires
                    ON idempotency_records(expires_at);

                CREATE TABLE IF NOT EXISTS outbox_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    room_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    dispatch_status TEXT NOT NULL DEFAULT 'PENDING'
                        CHECK (dispatch_status IN ('PENDING', 'DONE', 'FAILED')),
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_retry_at INTEGER NOT NULL,
                    locked_at INTEGER,
                    locked_by TEXT,
                    last_error TEXT,
                    processed_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_outbox_stream
                    ON outbox_events(room_id, id);
                CREATE INDEX IF NOT EXISTS idx_outbox_dispatch
                    ON outbox_events(dispatch_status, next_retry_at);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run a blocking closure against the connection on the blocking pool.
    ///
    /// The closure gets `&mut Connection` so it can open a transaction.
    pub(crate) async fn call<F, T>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    warn!("connection mutex poisoned, continuing with inner connection");
                    poisoned.into_inner()
                }
            };
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }
}

/// Current unix timestamp in seconds.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convert a usize limit to i64 for SQLite LIMIT clauses.
///
/// Returns an error if the value exceeds i64::MAX, which would wrap to a
/// negative LIMIT and change SQLite's behavior.
pub(crate) fn usize_to_i64_limit(limit: usize, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(limit).map_err(|_| {
        StoreError::storage(
            operation,
            format!("limit {} exceeds maximum storable value", limit),
        )
    })
}

/// Parse a TEXT uuid column, surfacing corruption instead of panicking.
pub(crate) fn parse_uuid(value: &str, what: &'static str) -> Result<uuid::Uuid, StoreError> {
    uuid::Uuid::parse_str(value).map_err(|_| StoreError::corruption(what))
}

/// In-memory connection with the full schema, for sync-layer tests.
#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory database");
    conn.execute_batch(
        "CREATE TABLE schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);",
    )
    .expect("should create schema_version table");
    SqliteStore::run_migrations(&conn, 0).expect("should run migrations");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_in_memory_initializes_schema() {
        let store = SqliteStore::new_in_memory().expect("should create in-memory store");
        let conn = store.conn.lock().unwrap();
        let version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .expect("should read version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let db_path = dir.path().join("quorum.db");

        {
            let _store = SqliteStore::new(&db_path).expect("first open should succeed");
        }
        {
            let _store = SqliteStore::new(&db_path).expect("second open should succeed");
        }
    }

    #[test]
    fn test_rejects_newer_schema_version() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let db_path = dir.path().join("future.db");

        {
            let conn = Connection::open(&db_path).expect("should open");
            conn.execute_batch(
                "CREATE TABLE schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);",
            )
            .expect("should create table");
            conn.execute(
                "INSERT INTO schema_version (id, version) VALUES (1, ?1)",
                params![CURRENT_SCHEMA_VERSION + 1],
            )
            .expect("should set version");
        }

        match SqliteStore::new(&db_path) {
            Ok(_) => panic!("should reject newer schema version"),
            Err(e) => assert!(e.to_string().contains("newer than supported")),
        }
    }
}
