//! Visibility reaper
//!
//! Returns leased-but-unacknowledged messages to the available state once
//! their lease stamp is older than the grace window. Runs periodically as a
//! background task and can be invoked on demand.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::persistence::{MessageStore, StoreError};

/// Releases expired leases
#[derive(Clone)]
pub struct VisibilityReaper {
    id: Uuid,
    store: Arc<dyn MessageStore>,
    grace_window: Duration,
    interval: Duration,
}

impl VisibilityReaper {
    /// Create a reaper over a store
    pub fn new(store: Arc<dyn MessageStore>, config: &DispatchConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            store,
            grace_window: config.unack_grace_window,
            interval: config.reaper_interval,
        }
    }

    /// Instance id, recorded on every log line of the loop
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Release expired leases across all queues
    #[instrument(skip(self), fields(reaper_id = %self.id))]
    pub async fn process_all_unacks(&self) -> Result<u64, StoreError> {
        let released = self
            .store
            .release_expired_leases(None, self.cutoff())
            .await?;
        if released > 0 {
            info!(released, "Released expired leases");
        }
        Ok(released)
    }

    /// Release expired leases of one queue
    #[instrument(skip(self), fields(reaper_id = %self.id))]
    pub async fn process_unacks(&self, queue_name: &str) -> Result<u64, StoreError> {
        let released = self
            .store
            .release_expired_leases(Some(queue_name), self.cutoff())
            .await?;
        if released > 0 {
            info!(queue = %queue_name, released, "Released expired leases");
        }
        Ok(released)
    }

    /// Leases stamped before this instant are expired
    fn cutoff(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::from_std(self.grace_window).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run the reaper every `reaper_interval` until `shutdown_rx` changes
    ///
    /// The first pass runs one interval after spawning.
    pub fn spawn(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.clone();

        tokio::spawn(async move {
            // interval_at panics on a zero period
            let period = reaper.interval.max(Duration::from_millis(1));
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            debug!(reaper_id = %reaper.id, interval_ms = reaper.interval.as_millis() as u64, "Reaper loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reaper.process_all_unacks().await {
                            error!(reaper_id = %reaper.id, "Lease release failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(reaper_id = %reaper.id, "Reaper loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!(reaper_id = %reaper.id, "Reaper loop exited");
        })
    }
}

impl std::fmt::Debug for VisibilityReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityReaper")
            .field("id", &self.id)
            .field("grace_window", &self.grace_window)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
