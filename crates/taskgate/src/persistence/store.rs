//! DispatchStore trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error (connectivity, timeout, query failure)
    #[error("database error: {0}")]
    Database(String),

    /// Schema migration error
    #[error("migration error: {0}")]
    Migration(String),
}

/// A queue entry as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub queue_name: String,
    pub message_id: String,
    pub payload: Option<String>,
    pub priority: i32,
    /// Delay requested by the last push or lease extension
    pub offset_time_seconds: i64,
    /// Earliest delivery instant while available, lease stamp while popped
    pub deliver_on: DateTime<Utc>,
    pub popped: bool,
    pub created_on: DateTime<Utc>,
}

impl QueueMessage {
    /// Whether a poller may lease this message at `now`
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.popped && self.deliver_on <= now
    }
}

/// Values written by a push
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub queue_name: String,
    pub message_id: String,
    pub payload: Option<String>,
    pub priority: i32,
    pub offset_time_seconds: i64,
    pub deliver_on: DateTime<Utc>,
}

/// Available/leased counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDetail {
    /// Rows with `popped = false`
    pub available: u64,
    /// Rows with `popped = true`
    pub leased: u64,
}

/// Presence-only guard against re-scheduling the same task attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTaskMarker {
    pub workflow_id: String,
    pub task_key: String,
    pub created_on: DateTime<Utc>,
}

/// Live instance of a concurrency-limited task type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgressMarker {
    pub task_def_name: String,
    pub task_id: String,
    pub workflow_id: String,
    pub in_progress: bool,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

/// Durable table of queue entries
///
/// Pure data access, no policy. Every mutation that participates in an
/// invariant is a single conditional write on one row.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    // =========================================================================
    // Queue registry
    // =========================================================================

    /// Register a queue name if unknown
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), StoreError>;

    /// Names of queues that currently hold at least one message
    async fn list_queues(&self) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or reset a message
    ///
    /// An existing row keeps its payload and `created_on`; priority, delay and
    /// `deliver_on` are overwritten and the row is made available again.
    async fn upsert_message(&self, message: NewMessage) -> Result<(), StoreError>;

    /// Insert a message unless `(queue_name, message_id)` exists
    ///
    /// Returns whether a row was inserted.
    async fn insert_message_if_absent(&self, message: NewMessage) -> Result<bool, StoreError>;

    /// Atomically flip an available message to leased
    ///
    /// Matches only `popped = false`; sets `popped = true` and stamps
    /// `deliver_on` with `leased_at`. Returns whether this caller won the row.
    async fn try_lease(
        &self,
        queue_name: &str,
        message_id: &str,
        leased_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Set `deliver_on` (and the informational delay) on an existing message
    ///
    /// Returns the number of rows updated.
    async fn set_deliver_on(
        &self,
        queue_name: &str,
        message_id: &str,
        offset_time_seconds: i64,
        deliver_on: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Make a message immediately available and un-leased
    async fn reset_delivery(
        &self,
        queue_name: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete one message; returns whether a row was removed
    async fn delete_message(&self, queue_name: &str, message_id: &str)
        -> Result<bool, StoreError>;

    /// Delete every message of a queue; returns the number of rows removed
    async fn delete_queue(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Release leases stamped before `cutoff`
    ///
    /// Scoped to one queue when `queue_name` is given. Only toggles `popped`;
    /// never deletes. Returns the number of rows released.
    async fn release_expired_leases(
        &self,
        queue_name: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Up to `limit` messages available at `now`
    ///
    /// Ordered by priority descending, then `created_on`, then `deliver_on`
    /// ascending.
    async fn find_available(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, StoreError>;

    /// Fetch one message
    async fn get_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError>;

    /// Whether `(queue_name, message_id)` exists
    async fn contains_message(&self, queue_name: &str, message_id: &str)
        -> Result<bool, StoreError>;

    /// All rows of a queue, leased and available
    async fn count_messages(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Available and leased counts for one queue
    async fn count_by_state(&self, queue_name: &str) -> Result<QueueDetail, StoreError>;
}

/// Dedup and in-progress markers used for admission control
#[async_trait]
pub trait MarkerStore: Send + Sync + 'static {
    // =========================================================================
    // Scheduled-task markers
    // =========================================================================

    /// Insert a `(workflow_id, task_key)` marker unless it exists
    ///
    /// Returns whether the insert happened. A unique-key conflict is `false`.
    async fn insert_scheduled_if_absent(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, StoreError>;

    /// Remove a scheduled-task marker; returns whether one existed
    async fn delete_scheduled(&self, workflow_id: &str, task_key: &str)
        -> Result<bool, StoreError>;

    // =========================================================================
    // In-progress markers
    // =========================================================================

    /// Insert an in-progress marker with `in_progress = false` unless it exists
    async fn insert_in_progress_if_absent(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
    ) -> Result<bool, StoreError>;

    /// Upsert an in-progress marker with the given flag
    async fn upsert_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
        in_progress: bool,
    ) -> Result<(), StoreError>;

    /// Delete an in-progress marker; returns whether one existed
    async fn delete_in_progress(&self, task_def_name: &str, task_id: &str)
        -> Result<bool, StoreError>;

    /// Markers of a task type with `in_progress = true`
    async fn count_in_progress(&self, task_def_name: &str) -> Result<u64, StoreError>;

    /// Task ids of the `limit` oldest markers of a task type, by `created_on`
    async fn oldest_in_progress(
        &self,
        task_def_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Fetch one marker
    async fn get_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
    ) -> Result<Option<InProgressMarker>, StoreError>;
}
