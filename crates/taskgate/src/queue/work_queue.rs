//! Work queue over a message store
//!
//! Emulates named FIFO-with-priority queues with delayed delivery and
//! at-least-once semantics on top of a [`MessageStore`]. A message is leased
//! by one poller at a time; leases that are never acknowledged are returned
//! to the queue by the [`VisibilityReaper`] the queue owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::message::Message;
use super::reaper::VisibilityReaper;
use crate::config::DispatchConfig;
use crate::persistence::{MessageStore, NewMessage, QueueDetail, StoreError};

/// Lower bound on the sleep between pop rounds
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on the result buffer reserved up front by a pop
const MAX_PREALLOCATED: usize = 1024;

/// Work queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A required argument was missing or blank
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Durable work queue
///
/// Constructing a queue with the reaper enabled starts the reaper on the
/// current tokio runtime; dropping the queue or calling [`WorkQueue::shutdown`]
/// stops it.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use taskgate::{DispatchConfig, InMemoryDispatchStore, WorkQueue};
///
/// let queue = WorkQueue::new(Arc::new(InMemoryDispatchStore::new()), DispatchConfig::default());
///
/// queue.push("emails", "msg-1", 0, Duration::ZERO).await?;
/// let ids = queue.pop("emails", 10, Duration::from_millis(500)).await?;
/// for id in ids {
///     // ... deliver
///     queue.ack("emails", &id).await?;
/// }
/// ```
pub struct WorkQueue {
    store: Arc<dyn MessageStore>,
    config: DispatchConfig,
    reaper: VisibilityReaper,
    shutdown_tx: watch::Sender<bool>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Create a work queue, starting its reaper if enabled
    ///
    /// A zero `poll_interval` is raised to [`MIN_POLL_INTERVAL`].
    pub fn new(store: Arc<dyn MessageStore>, mut config: DispatchConfig) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        let (shutdown_tx, _) = watch::channel(false);
        let reaper = VisibilityReaper::new(Arc::clone(&store), &config);

        let queue = Self {
            store,
            config,
            reaper,
            shutdown_tx,
            reaper_handle: Mutex::new(None),
        };

        if queue.config.reaper_enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                queue.start_reaper();
            } else {
                warn!("No tokio runtime at construction; reaper not started");
            }
        }

        queue
    }

    /// Start the background reaper
    ///
    /// No-op if it is already running. Must be called within a tokio runtime.
    pub fn start_reaper(&self) {
        let mut handle = self.reaper_handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        self.shutdown_tx.send_replace(false);
        *handle = Some(self.reaper.spawn(self.shutdown_tx.subscribe()));
        info!(
            reaper_id = %self.reaper.id(),
            grace_ms = self.config.unack_grace_window.as_millis() as u64,
            "Started visibility reaper"
        );
    }

    /// Stop the background reaper and wait for it to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.reaper_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Reaper task ended abnormally: {}", e);
            }
            info!(reaper_id = %self.reaper.id(), "Stopped visibility reaper");
        }
    }

    /// Whether the background reaper is running
    pub fn is_reaper_running(&self) -> bool {
        self.reaper_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// The reaper owned by this queue
    pub fn reaper(&self) -> &VisibilityReaper {
        &self.reaper
    }

    /// Queue configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Push a message without payload
    ///
    /// Re-pushing an existing id resets it to available with the new priority
    /// and delay; it never creates a duplicate.
    pub async fn push(
        &self,
        queue_name: &str,
        message_id: &str,
        priority: i32,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.push_message(queue_name, Message::new(message_id).with_priority(priority), delay)
            .await
    }

    /// Push a message with payload and priority
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn push_message(
        &self,
        queue_name: &str,
        message: Message,
        delay: Duration,
    ) -> Result<(), QueueError> {
        require(queue_name, "queue name is required")?;
        require(&message.id, "message id is required")?;

        self.store.ensure_queue(queue_name).await?;
        let row = new_message(queue_name, message, delay)?;
        self.store.upsert_message(row).await?;

        trace!(queue = %queue_name, delay_ms = delay.as_millis() as u64, "Pushed message");
        Ok(())
    }

    /// Push several messages, each available immediately
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn push_batch(
        &self,
        queue_name: &str,
        messages: Vec<Message>,
    ) -> Result<(), QueueError> {
        require(queue_name, "queue name is required")?;
        if messages.iter().any(|m| m.id.trim().is_empty()) {
            return Err(QueueError::InvalidArgument("message id is required"));
        }

        self.store.ensure_queue(queue_name).await?;
        let rows = messages
            .into_iter()
            .map(|m| new_message(queue_name, m, Duration::ZERO))
            .collect::<Result<Vec<_>, _>>()?;

        futures::future::try_join_all(rows.into_iter().map(|row| self.store.upsert_message(row)))
            .await?;

        Ok(())
    }

    /// Push unless the id is already present in the queue
    ///
    /// Returns whether the message was inserted.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn push_if_not_exists(
        &self,
        queue_name: &str,
        message: Message,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        require(queue_name, "queue name is required")?;
        require(&message.id, "message id is required")?;

        self.store.ensure_queue(queue_name).await?;
        let row = new_message(queue_name, message, delay)?;
        let inserted = self.store.insert_message_if_absent(row).await?;

        if !inserted {
            debug!(queue = %queue_name, "Message already queued");
        }
        Ok(inserted)
    }

    // =========================================================================
    // Pop
    // =========================================================================

    /// Lease up to `count` message ids, waiting at most `timeout`
    ///
    /// Returns whatever was leased when the timeout elapses, possibly nothing.
    pub async fn pop(
        &self,
        queue_name: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, QueueError> {
        let messages = self.poll_messages(queue_name, count, timeout).await?;
        Ok(messages.into_iter().map(|m| m.id).collect())
    }

    /// Lease up to `count` messages, waiting at most `timeout`
    ///
    /// Candidates are read in priority, then age order and each one is
    /// claimed with a conditional write; only the claims this caller wins
    /// are returned. Between rounds the loop sleeps for the poll interval.
    #[instrument(skip(self))]
    pub async fn poll_messages(
        &self,
        queue_name: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        require(queue_name, "queue name is required")?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let started = tokio::time::Instant::now();
        let mut leased = Vec::with_capacity(count.min(MAX_PREALLOCATED));

        loop {
            let wanted = count - leased.len();
            let now = Utc::now();
            let candidates = self.store.find_available(queue_name, now, wanted).await?;

            for candidate in candidates {
                if self
                    .store
                    .try_lease(queue_name, &candidate.message_id, now)
                    .await?
                {
                    leased.push(Message::from(candidate));
                } else {
                    trace!(message_id = %candidate.message_id, "Lost lease race");
                }
            }

            if leased.len() >= count {
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            tokio::time::sleep(self.config.poll_interval.min(timeout - elapsed)).await;
        }

        if !leased.is_empty() {
            debug!(leased = leased.len(), requested = count, "Leased messages");
        }
        Ok(leased)
    }

    // =========================================================================
    // Lease management
    // =========================================================================

    /// Acknowledge a message, removing it
    ///
    /// Returns whether a row was removed.
    #[instrument(skip(self))]
    pub async fn ack(&self, queue_name: &str, message_id: &str) -> Result<bool, QueueError> {
        require(queue_name, "queue name is required")?;
        require(message_id, "message id is required")?;

        Ok(self.store.delete_message(queue_name, message_id).await?)
    }

    /// Remove a message regardless of state
    #[instrument(skip(self))]
    pub async fn remove(&self, queue_name: &str, message_id: &str) -> Result<(), QueueError> {
        require(queue_name, "queue name is required")?;
        require(message_id, "message id is required")?;

        self.store.delete_message(queue_name, message_id).await?;
        Ok(())
    }

    /// Set the delivery deadline of a message to now plus `unack_timeout`
    ///
    /// For a leased message this extends its lease; for an available one it
    /// delays its next delivery. Returns whether exactly one row changed.
    #[instrument(skip(self))]
    pub async fn set_unack_timeout(
        &self,
        queue_name: &str,
        message_id: &str,
        unack_timeout: Duration,
    ) -> Result<bool, QueueError> {
        require(queue_name, "queue name is required")?;
        require(message_id, "message id is required")?;

        let deliver_on = deliver_on(Utc::now(), unack_timeout)?;
        let updated = self
            .store
            .set_deliver_on(
                queue_name,
                message_id,
                unack_timeout.as_secs() as i64,
                deliver_on,
            )
            .await?;

        Ok(updated == 1)
    }

    /// Make a message immediately available, dropping any lease
    #[instrument(skip(self))]
    pub async fn reset_offset_time(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, QueueError> {
        require(queue_name, "queue name is required")?;
        require(message_id, "message id is required")?;

        Ok(self
            .store
            .reset_delivery(queue_name, message_id, Utc::now())
            .await?)
    }

    /// Release expired leases across all queues
    pub async fn process_all_unacks(&self) -> Result<u64, QueueError> {
        Ok(self.reaper.process_all_unacks().await?)
    }

    /// Release expired leases of one queue
    pub async fn process_unacks(&self, queue_name: &str) -> Result<u64, QueueError> {
        require(queue_name, "queue name is required")?;
        Ok(self.reaper.process_unacks(queue_name).await?)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of messages in a queue, leased and available
    pub async fn get_size(&self, queue_name: &str) -> Result<u64, QueueError> {
        require(queue_name, "queue name is required")?;
        Ok(self.store.count_messages(queue_name).await?)
    }

    /// Available message count per queue
    ///
    /// Only queues with at least one available message are listed.
    pub async fn queues_detail(&self) -> Result<HashMap<String, u64>, QueueError> {
        let detail = self.queues_detail_verbose().await?;
        Ok(detail
            .into_iter()
            .filter(|(_, counts)| counts.available > 0)
            .map(|(name, counts)| (name, counts.available))
            .collect())
    }

    /// Available and leased counts per queue
    pub async fn queues_detail_verbose(&self) -> Result<HashMap<String, QueueDetail>, QueueError> {
        let mut detail = HashMap::new();
        for name in self.store.list_queues().await? {
            let counts = self.store.count_by_state(&name).await?;
            detail.insert(name, counts);
        }
        Ok(detail)
    }

    /// Whether a message id is present in a queue
    pub async fn contains_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, QueueError> {
        require(queue_name, "queue name is required")?;
        require(message_id, "message id is required")?;

        Ok(self.store.contains_message(queue_name, message_id).await?)
    }

    /// Delete every message of a queue
    #[instrument(skip(self))]
    pub async fn flush(&self, queue_name: &str) -> Result<u64, QueueError> {
        require(queue_name, "queue name is required")?;

        let removed = self.store.delete_queue(queue_name).await?;
        info!(queue = %queue_name, removed, "Flushed queue");
        Ok(removed)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("config", &self.config)
            .field("reaper", &self.reaper)
            .finish_non_exhaustive()
    }
}

fn require(value: &str, what: &'static str) -> Result<(), QueueError> {
    if value.trim().is_empty() {
        return Err(QueueError::InvalidArgument(what));
    }
    Ok(())
}

fn deliver_on(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, QueueError> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or(QueueError::InvalidArgument("delay is out of range"))
}

fn new_message(
    queue_name: &str,
    message: Message,
    delay: Duration,
) -> Result<NewMessage, QueueError> {
    Ok(NewMessage {
        queue_name: queue_name.to_string(),
        message_id: message.id,
        payload: message.payload,
        priority: message.priority,
        offset_time_seconds: delay.as_secs() as i64,
        deliver_on: deliver_on(Utc::now(), delay)?,
    })
}
