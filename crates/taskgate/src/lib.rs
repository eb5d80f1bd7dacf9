//! # Taskgate
//!
//! A PostgreSQL-backed task-dispatch core: durable work queues with at-least-once
//! delivery, plus admission control for concurrency-limited task types.
//!
//! ## Features
//!
//! - **Work queues on a table**: Priority ordering, delayed delivery and leases emulated with conditional row updates
//! - **Visibility reaper**: Leases that are never acknowledged return to the queue after a grace window
//! - **Admission control**: Per-task-type concurrency ceilings with first-arrived-first-served tie-breaking
//! - **Scheduling dedup**: Re-submitting the same task attempt is a no-op
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │   AdmissionController    │     │        WorkQueue         │
//! │  (dedup, in-progress     │     │  (push, pop, ack, extend │
//! │   limits)                │     │   owns VisibilityReaper) │
//! └──────────────────────────┘     └──────────────────────────┘
//!              │                                │
//!              ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              MarkerStore / MessageStore                      │
//! │  (PostgreSQL: taskgate_queue_messages, taskgate_task_*)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskgate::prelude::*;
//!
//! let store = Arc::new(PostgresDispatchStore::connect(&database_url, 10).await?);
//! store.migrate().await?;
//!
//! let admission = AdmissionController::new(store.clone());
//! let queue = WorkQueue::new(store, DispatchConfig::from_env());
//!
//! let task = TaskRef::new("wf-1", "task-1", "encode", "encode_ref").with_concurrency_limit(4);
//! if admission.schedule(&task).await? == ScheduleOutcome::Scheduled {
//!     queue.push("encode", &task.task_id, 0, Duration::ZERO).await?;
//! }
//! ```

pub mod admission;
pub mod config;
pub mod persistence;
pub mod queue;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::admission::{
        AdmissionController, AdmissionError, ScheduleOutcome, TaskRef, TaskStatus,
    };
    pub use crate::config::DispatchConfig;
    pub use crate::persistence::{
        InMemoryDispatchStore, MarkerStore, MessageStore, PostgresDispatchStore, QueueDetail,
        StoreError,
    };
    pub use crate::queue::{Message, QueueError, VisibilityReaper, WorkQueue};
}

// Re-export key types at crate root
pub use admission::{AdmissionController, AdmissionError, ScheduleOutcome, TaskRef, TaskStatus};
pub use config::{ConfigError, DispatchConfig};
pub use persistence::{
    InMemoryDispatchStore, MarkerStore, MessageStore, PostgresDispatchStore, QueueDetail,
    StoreError,
};
pub use queue::{Message, QueueError, VisibilityReaper, WorkQueue};
