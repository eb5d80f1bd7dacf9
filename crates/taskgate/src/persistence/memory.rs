//! In-memory implementation of the dispatch stores for testing

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;

type Key = (String, String);

fn key(a: &str, b: &str) -> Key {
    (a.to_string(), b.to_string())
}

/// Internal message row
struct MessageRow {
    message: QueueMessage,
    /// Insertion order, last tie-break after `created_on` and `deliver_on`
    seq: u64,
}

/// Internal in-progress row
struct InProgressRow {
    marker: InProgressMarker,
    seq: u64,
}

/// In-memory implementation of [`MessageStore`] and [`MarkerStore`]
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation: every
/// conditional write runs under a single write lock, so a compare-and-set
/// on one row cannot interleave with another.
///
/// # Example
///
/// ```
/// use taskgate::InMemoryDispatchStore;
///
/// let store = InMemoryDispatchStore::new();
/// assert_eq!(store.message_count(), 0);
/// ```
pub struct InMemoryDispatchStore {
    queues: RwLock<BTreeSet<String>>,
    messages: RwLock<HashMap<Key, MessageRow>>,
    scheduled: RwLock<HashMap<Key, ScheduledTaskMarker>>,
    in_progress: RwLock<HashMap<Key, InProgressRow>>,
    sequence_counter: AtomicU64,
}

impl InMemoryDispatchStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(BTreeSet::new()),
            messages: RwLock::new(HashMap::new()),
            scheduled: RwLock::new(HashMap::new()),
            in_progress: RwLock::new(HashMap::new()),
            sequence_counter: AtomicU64::new(0),
        }
    }

    /// Get the number of messages across all queues
    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    /// Get the number of scheduled-task markers
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.read().len()
    }

    /// Names of every queue ever pushed to
    pub fn known_queues(&self) -> Vec<String> {
        self.queues.read().iter().cloned().collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.queues.write().clear();
        self.messages.write().clear();
        self.scheduled.write().clear();
        self.in_progress.write().clear();
    }

    fn next_seq(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn new_row(&self, message: NewMessage) -> MessageRow {
        MessageRow {
            message: QueueMessage {
                queue_name: message.queue_name,
                message_id: message.message_id,
                payload: message.payload,
                priority: message.priority,
                offset_time_seconds: message.offset_time_seconds,
                deliver_on: message.deliver_on,
                popped: false,
                created_on: Utc::now(),
            },
            seq: self.next_seq(),
        }
    }
}

impl Default for InMemoryDispatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryDispatchStore {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        if !queues.contains(queue_name) {
            queues.insert(queue_name.to_string());
        }
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
        let messages = self.messages.read();
        let names: BTreeSet<String> = messages.keys().map(|(q, _)| q.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn upsert_message(&self, message: NewMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        let k = key(&message.queue_name, &message.message_id);

        match messages.get_mut(&k) {
            Some(row) => {
                row.message.priority = message.priority;
                row.message.offset_time_seconds = message.offset_time_seconds;
                row.message.deliver_on = message.deliver_on;
                row.message.popped = false;
            }
            None => {
                let row = self.new_row(message);
                messages.insert(k, row);
            }
        }
        Ok(())
    }

    async fn insert_message_if_absent(&self, message: NewMessage) -> Result<bool, StoreError> {
        let mut messages = self.messages.write();
        let k = key(&message.queue_name, &message.message_id);

        if messages.contains_key(&k) {
            return Ok(false);
        }
        let row = self.new_row(message);
        messages.insert(k, row);
        Ok(true)
    }

    async fn try_lease(
        &self,
        queue_name: &str,
        message_id: &str,
        leased_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut messages = self.messages.write();
        match messages.get_mut(&key(queue_name, message_id)) {
            Some(row) if !row.message.popped => {
                row.message.popped = true;
                row.message.deliver_on = leased_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_deliver_on(
        &self,
        queue_name: &str,
        message_id: &str,
        offset_time_seconds: i64,
        deliver_on: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut messages = self.messages.write();
        match messages.get_mut(&key(queue_name, message_id)) {
            Some(row) => {
                row.message.offset_time_seconds = offset_time_seconds;
                row.message.deliver_on = deliver_on;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn reset_delivery(
        &self,
        queue_name: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut messages = self.messages.write();
        match messages.get_mut(&key(queue_name, message_id)) {
            Some(row) => {
                row.message.offset_time_seconds = 0;
                row.message.deliver_on = now;
                row.message.popped = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .messages
            .write()
            .remove(&key(queue_name, message_id))
            .is_some())
    }

    async fn delete_queue(&self, queue_name: &str) -> Result<u64, StoreError> {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|(q, _), _| q != queue_name);
        Ok((before - messages.len()) as u64)
    }

    async fn release_expired_leases(
        &self,
        queue_name: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut messages = self.messages.write();
        let mut released = 0;

        for row in messages.values_mut() {
            if let Some(q) = queue_name {
                if row.message.queue_name != q {
                    continue;
                }
            }
            if row.message.popped && row.message.deliver_on < cutoff {
                row.message.popped = false;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn find_available(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, StoreError> {
        let messages = self.messages.read();
        let mut candidates: Vec<&MessageRow> = messages
            .values()
            .filter(|r| r.message.queue_name == queue_name && r.message.is_available(now))
            .collect();

        candidates.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then(a.message.created_on.cmp(&b.message.created_on))
                .then(a.message.deliver_on.cmp(&b.message.deliver_on))
                .then(a.seq.cmp(&b.seq))
        });

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|r| r.message.clone())
            .collect())
    }

    async fn get_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .get(&key(queue_name, message_id))
            .map(|r| r.message.clone()))
    }

    async fn contains_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .messages
            .read()
            .contains_key(&key(queue_name, message_id)))
    }

    async fn count_messages(&self, queue_name: &str) -> Result<u64, StoreError> {
        Ok(self
            .messages
            .read()
            .keys()
            .filter(|(q, _)| q == queue_name)
            .count() as u64)
    }

    async fn count_by_state(&self, queue_name: &str) -> Result<QueueDetail, StoreError> {
        let messages = self.messages.read();
        let mut detail = QueueDetail::default();
        for row in messages.values().filter(|r| r.message.queue_name == queue_name) {
            if row.message.popped {
                detail.leased += 1;
            } else {
                detail.available += 1;
            }
        }
        Ok(detail)
    }
}

#[async_trait]
impl MarkerStore for InMemoryDispatchStore {
    async fn insert_scheduled_if_absent(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, StoreError> {
        let mut scheduled = self.scheduled.write();
        let k = key(workflow_id, task_key);
        if scheduled.contains_key(&k) {
            return Ok(false);
        }
        scheduled.insert(
            k,
            ScheduledTaskMarker {
                workflow_id: workflow_id.to_string(),
                task_key: task_key.to_string(),
                created_on: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn delete_scheduled(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .scheduled
            .write()
            .remove(&key(workflow_id, task_key))
            .is_some())
    }

    async fn insert_in_progress_if_absent(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
    ) -> Result<bool, StoreError> {
        let mut rows = self.in_progress.write();
        let k = key(task_def_name, task_id);
        if rows.contains_key(&k) {
            return Ok(false);
        }
        let now = Utc::now();
        rows.insert(
            k,
            InProgressRow {
                marker: InProgressMarker {
                    task_def_name: task_def_name.to_string(),
                    task_id: task_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    in_progress: false,
                    created_on: now,
                    modified_on: now,
                },
                seq: self.next_seq(),
            },
        );
        Ok(true)
    }

    async fn upsert_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
        in_progress: bool,
    ) -> Result<(), StoreError> {
        let mut rows = self.in_progress.write();
        let now = Utc::now();

        match rows.get_mut(&key(task_def_name, task_id)) {
            Some(row) => {
                row.marker.in_progress = in_progress;
                row.marker.modified_on = now;
            }
            None => {
                rows.insert(
                    key(task_def_name, task_id),
                    InProgressRow {
                        marker: InProgressMarker {
                            task_def_name: task_def_name.to_string(),
                            task_id: task_id.to_string(),
                            workflow_id: workflow_id.to_string(),
                            in_progress,
                            created_on: now,
                            modified_on: now,
                        },
                        seq: self.next_seq(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .in_progress
            .write()
            .remove(&key(task_def_name, task_id))
            .is_some())
    }

    async fn count_in_progress(&self, task_def_name: &str) -> Result<u64, StoreError> {
        Ok(self
            .in_progress
            .read()
            .values()
            .filter(|r| r.marker.task_def_name == task_def_name && r.marker.in_progress)
            .count() as u64)
    }

    async fn oldest_in_progress(
        &self,
        task_def_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self.in_progress.read();
        let mut markers: Vec<&InProgressRow> = rows
            .values()
            .filter(|r| r.marker.task_def_name == task_def_name)
            .collect();

        markers.sort_by(|a, b| {
            a.marker
                .created_on
                .cmp(&b.marker.created_on)
                .then(a.seq.cmp(&b.seq))
        });

        Ok(markers
            .into_iter()
            .take(limit)
            .map(|r| r.marker.task_id.clone())
            .collect())
    }

    async fn get_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
    ) -> Result<Option<InProgressMarker>, StoreError> {
        Ok(self
            .in_progress
            .read()
            .get(&key(task_def_name, task_id))
            .map(|r| r.marker.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(queue: &str, id: &str, priority: i32) -> NewMessage {
        NewMessage {
            queue_name: queue.to_string(),
            message_id: id.to_string(),
            payload: None,
            priority,
            offset_time_seconds: 0,
            deliver_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_single_row() {
        let store = InMemoryDispatchStore::new();

        store.upsert_message(new_message("q", "m1", 1)).await.unwrap();
        store.upsert_message(new_message("q", "m1", 7)).await.unwrap();

        assert_eq!(store.message_count(), 1);
        let message = store.get_message("q", "m1").await.unwrap().unwrap();
        assert_eq!(message.priority, 7);
    }

    #[tokio::test]
    async fn test_upsert_resets_lease_and_keeps_payload() {
        let store = InMemoryDispatchStore::new();
        let mut first = new_message("q", "m1", 0);
        first.payload = Some("body".to_string());
        store.upsert_message(first).await.unwrap();

        assert!(store.try_lease("q", "m1", Utc::now()).await.unwrap());
        store.upsert_message(new_message("q", "m1", 2)).await.unwrap();

        let message = store.get_message("q", "m1").await.unwrap().unwrap();
        assert!(!message.popped);
        assert_eq!(message.payload.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let store = InMemoryDispatchStore::new();

        assert!(store
            .insert_message_if_absent(new_message("q", "m1", 0))
            .await
            .unwrap());
        assert!(!store
            .insert_message_if_absent(new_message("q", "m1", 5))
            .await
            .unwrap());

        let message = store.get_message("q", "m1").await.unwrap().unwrap();
        assert_eq!(message.priority, 0);
    }

    #[tokio::test]
    async fn test_try_lease_only_once() {
        let store = InMemoryDispatchStore::new();
        store.upsert_message(new_message("q", "m1", 0)).await.unwrap();

        assert!(store.try_lease("q", "m1", Utc::now()).await.unwrap());
        assert!(!store.try_lease("q", "m1", Utc::now()).await.unwrap());
        assert!(!store.try_lease("q", "missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_available_ordering() {
        let store = InMemoryDispatchStore::new();
        store.upsert_message(new_message("q", "a", 5)).await.unwrap();
        store.upsert_message(new_message("q", "b", 5)).await.unwrap();
        store.upsert_message(new_message("q", "c", 9)).await.unwrap();
        store.upsert_message(new_message("other", "x", 100)).await.unwrap();

        let found = store.find_available("q", Utc::now(), 10).await.unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_find_available_skips_delayed_and_leased() {
        let store = InMemoryDispatchStore::new();
        let mut delayed = new_message("q", "later", 0);
        delayed.deliver_on = Utc::now() + chrono::Duration::seconds(60);
        store.upsert_message(delayed).await.unwrap();
        store.upsert_message(new_message("q", "leased", 0)).await.unwrap();
        store.upsert_message(new_message("q", "ready", 0)).await.unwrap();
        store.try_lease("q", "leased", Utc::now()).await.unwrap();

        let found = store.find_available("q", Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message_id, "ready");
    }

    #[tokio::test]
    async fn test_release_expired_leases_scoped() {
        let store = InMemoryDispatchStore::new();
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        store.upsert_message(new_message("q1", "m", 0)).await.unwrap();
        store.upsert_message(new_message("q2", "m", 0)).await.unwrap();
        store.try_lease("q1", "m", long_ago).await.unwrap();
        store.try_lease("q2", "m", long_ago).await.unwrap();

        let released = store
            .release_expired_leases(Some("q1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(store.count_by_state("q2").await.unwrap().leased, 1);

        // Idempotent
        let released = store
            .release_expired_leases(Some("q1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(released, 0);
    }

    #[tokio::test]
    async fn test_scheduled_marker_dedup() {
        let store = InMemoryDispatchStore::new();

        assert!(store.insert_scheduled_if_absent("wf", "t_0").await.unwrap());
        assert!(!store.insert_scheduled_if_absent("wf", "t_0").await.unwrap());
        assert_eq!(store.scheduled_count(), 1);

        assert!(store.delete_scheduled("wf", "t_0").await.unwrap());
        assert!(store.insert_scheduled_if_absent("wf", "t_0").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_progress_markers() {
        let store = InMemoryDispatchStore::new();

        assert!(store
            .insert_in_progress_if_absent("encode", "t1", "wf")
            .await
            .unwrap());
        assert!(!store
            .insert_in_progress_if_absent("encode", "t1", "wf")
            .await
            .unwrap());
        assert_eq!(store.count_in_progress("encode").await.unwrap(), 0);

        store
            .upsert_in_progress("encode", "t1", "wf", true)
            .await
            .unwrap();
        store
            .upsert_in_progress("encode", "t2", "wf", true)
            .await
            .unwrap();
        assert_eq!(store.count_in_progress("encode").await.unwrap(), 2);

        let oldest = store.oldest_in_progress("encode", 1).await.unwrap();
        assert_eq!(oldest, vec!["t1".to_string()]);

        assert!(store.delete_in_progress("encode", "t1").await.unwrap());
        assert!(!store.delete_in_progress("encode", "t1").await.unwrap());
        assert_eq!(store.count_in_progress("encode").await.unwrap(), 1);
    }
}
