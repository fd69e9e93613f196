use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Retention of COMPLETED idempotency records, i.e. how long a replay
    /// of the same key returns the stored response.
    pub idempotency_ttl_secs: i64,
    /// Age after which an orphaned IN_PROGRESS idempotency record (crash
    /// before completion) may be reclaimed by a new attempt.
    pub idempotency_stale_secs: i64,
    pub stream_poll_interval: Duration,
    pub stream_batch_limit: usize,
    pub stream_heartbeat: Duration,
    /// Reconnect backoff advised to SSE clients via the `retry:` directive.
    pub stream_retry: Duration,
    pub dispatch_poll_interval: Duration,
    pub dispatch_batch_size: usize,
    pub dispatch_max_attempts: u32,
    pub dispatch_lock_ttl_secs: i64,
    /// Retention of outbox rows. Must exceed the longest client reconnect
    /// gap the deployment wants to support.
    pub outbox_retention_secs: i64,
    pub development: bool,
}

fn optional_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let idempotency_ttl_secs = optional_u64("IDEMPOTENCY_TTL_SECS", 86_400)? as i64;
        let idempotency_stale_secs = optional_u64("IDEMPOTENCY_STALE_SECS", 900)? as i64;

        let stream_poll_interval =
            Duration::from_millis(optional_u64("STREAM_POLL_INTERVAL_MS", 1_000)?);
        let stream_batch_limit = optional_u64("STREAM_BATCH_LIMIT", 100)? as usize;
        let stream_heartbeat = Duration::from_secs(optional_u64("STREAM_HEARTBEAT_SECS", 30)?);
        let stream_retry = Duration::from_millis(optional_u64("STREAM_RETRY_MS", 5_000)?);

        let dispatch_poll_interval =
            Duration::from_secs(optional_u64("DISPATCH_POLL_INTERVAL_SECS", 5)?);
        let dispatch_batch_size = optional_u64("DISPATCH_BATCH_SIZE", 10)? as usize;
        let dispatch_max_attempts = optional_u64("DISPATCH_MAX_ATTEMPTS", 3)? as u32;
        let dispatch_lock_ttl_secs = optional_u64("DISPATCH_LOCK_TTL_SECS", 300)? as i64;

        let outbox_retention_secs = optional_u64("OUTBOX_RETENTION_SECS", 86_400)? as i64;

        let development = is_development(env::var("ENVIRONMENT").ok().as_deref());

        Ok(Config {
            port,
            state_dir,
            idempotency_ttl_secs,
            idempotency_stale_secs,
            stream_poll_interval,
            stream_batch_limit,
            stream_heartbeat,
            stream_retry,
            dispatch_poll_interval,
            dispatch_batch_size,
            dispatch_max_attempts,
            dispatch_lock_ttl_secs,
            outbox_retention_secs,
            development,
        })
    }
}

/// Classify the ENVIRONMENT variable. Anything that is not explicitly a
/// development value is treated as production.
pub fn is_development(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(v.to_lowercase().as_str(), "development" | "dev" | "local"),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_development_unset() {
        assert!(is_development(None));
    }

    #[test]
    fn test_is_development_variants() {
        assert!(is_development(Some("development")));
        assert!(is_development(Some("DEV")));
        assert!(is_development(Some("local")));
    }

    #[test]
    fn test_is_development_production() {
        assert!(!is_development(Some("production")));
        assert!(!is_development(Some("staging")));
        assert!(!is_development(Some("")));
    }
}
