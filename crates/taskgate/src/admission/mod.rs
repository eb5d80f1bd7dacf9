//! Admission control
//!
//! This module provides:
//! - [`AdmissionController`] for concurrency limits and scheduling dedup
//! - [`TaskRef`] and [`TaskStatus`] describing the task under decision

mod controller;
mod task;

pub use controller::{AdmissionController, AdmissionError};
pub use task::{task_key, ScheduleOutcome, TaskRef, TaskStatus};
