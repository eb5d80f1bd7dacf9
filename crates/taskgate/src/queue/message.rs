//! Caller-facing queue message

use serde::{Deserialize, Serialize};

use crate::persistence::QueueMessage;

/// A message as pushed by producers and handed to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Caller-chosen id, unique within a queue
    pub id: String,

    /// Opaque payload
    pub payload: Option<String>,

    /// Higher is served first
    pub priority: i32,
}

impl Message {
    /// Create a message with no payload and priority 0
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: None,
            priority: 0,
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Set the payload to a JSON document
    pub fn with_json_payload(
        self,
        payload: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_string(payload)?;
        Ok(self.with_payload(body))
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Parse the payload as JSON, if any
    pub fn json_payload(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.payload.as_deref().map(serde_json::from_str).transpose()
    }
}

impl From<QueueMessage> for Message {
    fn from(message: QueueMessage) -> Self {
        Self {
            id: message.message_id,
            payload: message.payload,
            priority: message.priority,
        }
    }
}
