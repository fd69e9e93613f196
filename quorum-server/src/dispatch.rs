//! Background delivery of outbox events.
//!
//! The dispatcher claims batches of PENDING events, hands them to a
//! `NotificationSender`, and records the result. Delivery is at-least-once:
//! a crash between send and mark-done redelivers after the lock TTL.
//! Repeated failures back off exponentially until the event dead-letters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::store::outbox::ClaimedEvent;
use crate::store::SqliteStore;

/// Delivery channel for outbox events.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, event: &ClaimedEvent) -> Result<()>;
}

/// Sender that writes events to the log. The default channel until a real
/// push integration is configured.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, event: &ClaimedEvent) -> Result<()> {
        info!(
            event_id = event.id,
            event_type = %event.event_type,
            room_id = %event.room_id,
            "delivering notification"
        );
        Ok(())
    }
}

pub struct Dispatcher {
    store: Arc<SqliteStore>,
    sender: Arc<dyn NotificationSender>,
    worker_id: String,
    batch_size: usize,
    max_attempts: u32,
    lock_ttl_secs: i64,
}

impl Dispatcher {
    pub fn new(store: Arc<SqliteStore>, sender: Arc<dyn NotificationSender>, config: &Config) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "quorum".to_string());
        Dispatcher {
            store,
            sender,
            worker_id: format!("{}-{}", host, std::process::id()),
            batch_size: config.dispatch_batch_size,
            max_attempts: config.dispatch_max_attempts,
            lock_ttl_secs: config.dispatch_lock_ttl_secs,
        }
    }

    /// Claim and process one batch. Returns the number of claimed events.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let batch = self
            .store
            .claim_pending_events(self.worker_id.clone(), self.batch_size, self.lock_ttl_secs)
            .await?;
        let claimed = batch.len();

        for event in batch {
            match self.sender.send(&event).await {
                Ok(()) => {
                    self.store.mark_event_done(event.id).await?;
                }
                Err(e) => {
                    let attempts = self
                        .store
                        .mark_event_failed(event.id, e.to_string(), self.max_attempts)
                        .await?;
                    if attempts >= self.max_attempts {
                        warn!(
                            event_id = event.id,
                            attempts, "event dead-lettered after delivery failure: {}", e
                        );
                    } else {
                        debug!(
                            event_id = event.id,
                            attempts, "delivery failed, will retry: {}", e
                        );
                    }
                }
            }
        }

        Ok(claimed)
    }

    /// Poll forever. Drains consecutive full batches before sleeping.
    pub async fn run(self, poll_interval: Duration) {
        info!(worker_id = %self.worker_id, "dispatch worker started");
        loop {
            match self.run_once().await {
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => warn!("dispatch batch failed: {}", e),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Interval between retention sweeps.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically delete terminal outbox rows past retention and expired
/// idempotency records.
pub async fn retention_loop(store: Arc<SqliteStore>, outbox_retention_secs: i64) {
    loop {
        match store.cleanup_old_events(outbox_retention_secs).await {
            Ok(n) if n > 0 => info!(deleted = n, "swept old outbox events"),
            Ok(_) => {}
            Err(e) => warn!("outbox retention sweep failed: {}", e),
        }
        match store.cleanup_expired_idempotency().await {
            Ok(n) if n > 0 => info!(deleted = n, "swept expired idempotency records"),
            Ok(_) => {}
            Err(e) => warn!("idempotency retention sweep failed: {}", e),
        }
        tokio::time::sleep(RETENTION_SWEEP_INTERVAL).await;
    }
}
