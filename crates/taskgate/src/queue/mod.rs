//! Durable work queue
//!
//! This module provides:
//! - [`WorkQueue`] push/pop/ack over a [`MessageStore`](crate::persistence::MessageStore)
//! - [`VisibilityReaper`] for releasing expired leases
//! - [`Message`] as pushed and polled by callers

mod message;
mod reaper;
mod work_queue;

pub use message::Message;
pub use reaper::VisibilityReaper;
pub use work_queue::{QueueError, WorkQueue};
