//! Persistence layer for dispatch state
//!
//! This module provides:
//! - [`MessageStore`] trait for queue entries
//! - [`MarkerStore`] trait for dedup and in-progress markers
//! - [`InMemoryDispatchStore`] for testing
//! - [`PostgresDispatchStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryDispatchStore;
pub use postgres::PostgresDispatchStore;
pub use store::{
    InProgressMarker, MarkerStore, MessageStore, NewMessage, QueueDetail, QueueMessage,
    ScheduledTaskMarker, StoreError,
};
