//! Admission controller
//!
//! Per-task-type concurrency limiting and idempotent scheduling dedup. Every
//! decision is made against shared markers in a [`MarkerStore`]; the only
//! serialization relied upon is the store's single-row conditional write.

use std::sync::Arc;

use tracing::{debug, info, instrument, trace};

use super::task::{ScheduleOutcome, TaskRef, TaskStatus};
use crate::persistence::{MarkerStore, StoreError};

/// Admission errors
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// A required argument was missing or blank
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Admission controller
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use taskgate::{AdmissionController, InMemoryDispatchStore, ScheduleOutcome, TaskRef, TaskStatus};
///
/// let admission = AdmissionController::new(Arc::new(InMemoryDispatchStore::new()));
/// let task = TaskRef::new("wf-1", "task-1", "encode", "encode_ref").with_concurrency_limit(2);
///
/// if admission.schedule(&task).await? == ScheduleOutcome::Scheduled {
///     if !admission.exceeds_in_progress_limit(&task).await? {
///         admission.on_status_change(&task, TaskStatus::InProgress).await?;
///         // ... push to the work queue
///     }
/// }
/// ```
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn MarkerStore>,
}

impl AdmissionController {
    /// Create a controller over a marker store
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    // =========================================================================
    // Dedup
    // =========================================================================

    /// Record that `(workflow_id, task_key)` has been scheduled
    ///
    /// Returns `false` if it already was; the caller treats that as a no-op.
    #[instrument(skip(self))]
    pub async fn try_schedule_once(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, AdmissionError> {
        require(workflow_id, "workflow id is required")?;
        require(task_key, "task key is required")?;

        let inserted = self
            .store
            .insert_scheduled_if_absent(workflow_id, task_key)
            .await?;
        if !inserted {
            trace!("Task already scheduled");
        }
        Ok(inserted)
    }

    /// Dedup a task attempt, then start tracking it if its type is limited
    ///
    /// The dedup guard runs before any other write.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, workflow_id = %task.workflow_id))]
    pub async fn schedule(&self, task: &TaskRef) -> Result<ScheduleOutcome, AdmissionError> {
        validate(task)?;

        if !self
            .try_schedule_once(&task.workflow_id, &task.task_key())
            .await?
        {
            return Ok(ScheduleOutcome::AlreadyScheduled);
        }

        if task.is_limited() {
            self.track(&task.task_def_name, &task.task_id, &task.workflow_id)
                .await?;
        }

        debug!(task_key = %task.task_key(), "Task scheduled");
        Ok(ScheduleOutcome::Scheduled)
    }

    // =========================================================================
    // Concurrency limiting
    // =========================================================================

    /// Register a live instance of a task type, not yet in progress
    ///
    /// Keeps the existing marker, and so its arrival time, if present.
    #[instrument(skip(self))]
    pub async fn track(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
    ) -> Result<(), AdmissionError> {
        require(task_def_name, "task definition name is required")?;
        require(task_id, "task id is required")?;

        self.store
            .insert_in_progress_if_absent(task_def_name, task_id, workflow_id)
            .await?;
        Ok(())
    }

    /// Whether `task_id` may run under a limit of `limit` concurrent instances
    ///
    /// Rejects when `limit` instances are already in progress. Otherwise the
    /// task must be among the `limit` oldest tracked instances of its type.
    #[instrument(skip(self))]
    pub async fn admit(
        &self,
        task_def_name: &str,
        task_id: &str,
        limit: i32,
    ) -> Result<bool, AdmissionError> {
        require(task_def_name, "task definition name is required")?;
        require(task_id, "task id is required")?;

        if limit <= 0 {
            return Ok(true);
        }

        let current = self.store.count_in_progress(task_def_name).await?;
        if current >= limit as u64 {
            info!(limit, current, "Task execution count limited");
            return Ok(false);
        }

        let oldest = self
            .store
            .oldest_in_progress(task_def_name, limit as usize)
            .await?;
        let admitted = oldest.iter().any(|id| id == task_id);

        if admitted {
            debug!(limit, current, "Task admitted");
        } else {
            info!(limit, current, "Task execution count limited by arrival order");
        }
        Ok(admitted)
    }

    /// Whether the task would exceed its type's concurrency limit
    pub async fn exceeds_in_progress_limit(&self, task: &TaskRef) -> Result<bool, AdmissionError> {
        let admitted = self
            .admit(&task.task_def_name, &task.task_id, task.concurrency_limit)
            .await?;
        Ok(!admitted)
    }

    /// Set the in-progress flag of an instance, creating its marker if needed
    #[instrument(skip(self))]
    pub async fn mark_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
        in_progress: bool,
    ) -> Result<(), AdmissionError> {
        require(task_def_name, "task definition name is required")?;
        require(task_id, "task id is required")?;

        self.store
            .upsert_in_progress(task_def_name, task_id, workflow_id, in_progress)
            .await?;
        Ok(())
    }

    /// Stop tracking an instance; returns whether it was tracked
    #[instrument(skip(self))]
    pub async fn release(&self, task_def_name: &str, task_id: &str) -> Result<bool, AdmissionError> {
        require(task_def_name, "task definition name is required")?;
        require(task_id, "task id is required")?;

        let removed = self.store.delete_in_progress(task_def_name, task_id).await?;
        if removed {
            debug!("Released in-progress marker");
        }
        Ok(removed)
    }

    /// Apply a task status transition to its in-progress marker
    ///
    /// Terminal statuses release the marker. Otherwise, for limited types, the
    /// flag follows whether the status is `IN_PROGRESS`.
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn on_status_change(
        &self,
        task: &TaskRef,
        status: TaskStatus,
    ) -> Result<(), AdmissionError> {
        validate(task)?;

        if status.is_terminal() {
            self.release(&task.task_def_name, &task.task_id).await?;
        } else if task.is_limited() {
            self.mark_in_progress(
                &task.task_def_name,
                &task.task_id,
                &task.workflow_id,
                status == TaskStatus::InProgress,
            )
            .await?;
        }
        Ok(())
    }

    /// Drop every admission marker of a task
    ///
    /// Returns whether the dedup marker existed.
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn remove_task(&self, task: &TaskRef) -> Result<bool, AdmissionError> {
        validate(task)?;

        let existed = self
            .store
            .delete_scheduled(&task.workflow_id, &task.task_key())
            .await?;
        self.store
            .delete_in_progress(&task.task_def_name, &task.task_id)
            .await?;
        Ok(existed)
    }

    /// Number of in-progress instances of a task type
    pub async fn in_progress_count(&self, task_def_name: &str) -> Result<u64, AdmissionError> {
        require(task_def_name, "task definition name is required")?;
        Ok(self.store.count_in_progress(task_def_name).await?)
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController").finish_non_exhaustive()
    }
}

fn require(value: &str, what: &'static str) -> Result<(), AdmissionError> {
    if value.trim().is_empty() {
        return Err(AdmissionError::InvalidArgument(what));
    }
    Ok(())
}

fn validate(task: &TaskRef) -> Result<(), AdmissionError> {
    require(&task.workflow_id, "workflow id is required")?;
    require(&task.task_id, "task id is required")?;
    require(&task.task_def_name, "task definition name is required")?;
    require(&task.reference_name, "task reference name is required")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryDispatchStore;

    fn controller() -> (Arc<InMemoryDispatchStore>, AdmissionController) {
        let store = Arc::new(InMemoryDispatchStore::new());
        (store.clone(), AdmissionController::new(store))
    }

    fn limited(task_id: &str, limit: i32) -> TaskRef {
        TaskRef::new("wf", task_id, "encode", format!("ref_{}", task_id))
            .with_concurrency_limit(limit)
    }

    #[tokio::test]
    async fn test_try_schedule_once_dedups() {
        let (store, admission) = controller();

        assert!(admission.try_schedule_once("wf", "encode_0").await.unwrap());
        assert!(!admission.try_schedule_once("wf", "encode_0").await.unwrap());
        assert!(admission.try_schedule_once("wf", "encode_1").await.unwrap());
        assert_eq!(store.scheduled_count(), 2);
    }

    #[tokio::test]
    async fn test_blank_arguments_are_rejected() {
        let (store, admission) = controller();

        let err = admission.try_schedule_once("", "k").await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidArgument(_)));

        let err = admission.admit("encode", " ", 1).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidArgument(_)));

        let err = admission
            .schedule(&TaskRef::new("wf", "t1", "encode", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidArgument(_)));

        assert_eq!(store.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_always_admits() {
        let (_, admission) = controller();
        assert!(admission.admit("encode", "anything", 0).await.unwrap());
        assert!(admission.admit("encode", "anything", -1).await.unwrap());
    }

    #[tokio::test]
    async fn test_admission_boundary() {
        let (_, admission) = controller();

        for id in ["a", "b", "c"] {
            admission.track("encode", id, "wf").await.unwrap();
            admission.mark_in_progress("encode", id, "wf", true).await.unwrap();
        }
        admission.track("encode", "d", "wf").await.unwrap();

        assert!(!admission.admit("encode", "d", 3).await.unwrap());

        assert!(admission.release("encode", "a").await.unwrap());
        assert!(admission.admit("encode", "d", 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_arrival_order_breaks_ties() {
        let (_, admission) = controller();

        for id in ["first", "second", "third"] {
            admission.track("encode", id, "wf").await.unwrap();
        }

        assert!(admission.admit("encode", "first", 2).await.unwrap());
        assert!(admission.admit("encode", "second", 2).await.unwrap());
        assert!(!admission.admit("encode", "third", 2).await.unwrap());

        // Untracked tasks are never among the oldest
        assert!(!admission.admit("encode", "stranger", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let (store, admission) = controller();
        let task = limited("t1", 1);

        assert_eq!(admission.schedule(&task).await.unwrap(), ScheduleOutcome::Scheduled);
        assert_eq!(
            admission.schedule(&task).await.unwrap(),
            ScheduleOutcome::AlreadyScheduled
        );

        let marker = store.get_in_progress("encode", "t1").await.unwrap().unwrap();
        assert!(!marker.in_progress);
        assert!(!admission.exceeds_in_progress_limit(&task).await.unwrap());

        admission
            .on_status_change(&task, TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(admission.in_progress_count("encode").await.unwrap(), 1);

        // A second instance of the type is now over the limit
        let other = limited("t2", 1);
        admission.schedule(&other).await.unwrap();
        assert!(admission.exceeds_in_progress_limit(&other).await.unwrap());

        admission
            .on_status_change(&task, TaskStatus::Completed)
            .await
            .unwrap();
        assert!(store.get_in_progress("encode", "t1").await.unwrap().is_none());
        assert!(!admission.exceeds_in_progress_limit(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlimited_task_is_not_tracked() {
        let (store, admission) = controller();
        let task = TaskRef::new("wf", "t1", "encode", "encode_ref");

        assert_eq!(admission.schedule(&task).await.unwrap(), ScheduleOutcome::Scheduled);
        admission
            .on_status_change(&task, TaskStatus::InProgress)
            .await
            .unwrap();

        assert!(store.get_in_progress("encode", "t1").await.unwrap().is_none());
        assert!(!admission.exceeds_in_progress_limit(&task).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_task_allows_reschedule() {
        let (store, admission) = controller();
        let task = limited("t1", 2);

        admission.schedule(&task).await.unwrap();
        assert!(admission.remove_task(&task).await.unwrap());
        assert!(!admission.remove_task(&task).await.unwrap());
        assert!(store.get_in_progress("encode", "t1").await.unwrap().is_none());

        assert_eq!(admission.schedule(&task).await.unwrap(), ScheduleOutcome::Scheduled);
    }

    #[tokio::test]
    async fn test_retry_is_a_new_attempt() {
        let (_, admission) = controller();
        let task = limited("t1", 0);

        assert_eq!(admission.schedule(&task).await.unwrap(), ScheduleOutcome::Scheduled);
        let retry = task.clone().with_retry_count(1);
        assert_eq!(admission.schedule(&retry).await.unwrap(), ScheduleOutcome::Scheduled);
    }
}
