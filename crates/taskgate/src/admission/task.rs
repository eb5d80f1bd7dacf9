//! Task identity and status as seen by admission control

use serde::{Deserialize, Serialize};

/// Task status reported by the workflow layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    InProgress,
    Canceled,
    Failed,
    FailedWithTerminalError,
    Completed,
    CompletedWithErrors,
    TimedOut,
    Skipped,
}

impl TaskStatus {
    /// Whether the task can no longer run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Scheduled | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Skipped => "SKIPPED",
        };
        write!(f, "{}", s)
    }
}

/// Identity of one task attempt presented for admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub workflow_id: String,
    pub task_id: String,
    /// Task type; concurrency limits apply per type
    pub task_def_name: String,
    /// Reference name of the task within its workflow
    pub reference_name: String,
    pub retry_count: u32,
    /// Maximum concurrent instances of the type; `<= 0` means unlimited
    pub concurrency_limit: i32,
}

impl TaskRef {
    /// Create a task reference with no retry and no concurrency limit
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        task_def_name: impl Into<String>,
        reference_name: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            task_def_name: task_def_name.into(),
            reference_name: reference_name.into(),
            retry_count: 0,
            concurrency_limit: 0,
        }
    }

    /// Set the retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the concurrency limit of the task type
    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Dedup key of this attempt
    pub fn task_key(&self) -> String {
        task_key(&self.reference_name, self.retry_count)
    }

    /// Whether the task type is concurrency-limited
    pub fn is_limited(&self) -> bool {
        self.concurrency_limit > 0
    }
}

/// Dedup key for a task attempt: `"{reference_name}_{retry_count}"`
pub fn task_key(reference_name: &str, retry_count: u32) -> String {
    format!("{}_{}", reference_name, retry_count)
}

/// Result of [`AdmissionController::schedule`](super::AdmissionController::schedule)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// First submission of this attempt; markers were created
    Scheduled,
    /// The attempt was already scheduled; nothing changed
    AlreadyScheduled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key() {
        assert_eq!(task_key("encode", 0), "encode_0");

        let task = TaskRef::new("wf", "t1", "encode_def", "encode").with_retry_count(2);
        assert_eq!(task.task_key(), "encode_2");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::FailedWithTerminalError.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(TaskStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_status_serde_matches_display() {
        let json = serde_json::to_string(&TaskStatus::FailedWithTerminalError).unwrap();
        assert_eq!(json, "\"FAILED_WITH_TERMINAL_ERROR\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "IN_PROGRESS");
    }

    #[test]
    fn test_is_limited() {
        let task = TaskRef::new("wf", "t1", "def", "ref");
        assert!(!task.is_limited());
        assert!(task.with_concurrency_limit(2).is_limited());
    }
}
