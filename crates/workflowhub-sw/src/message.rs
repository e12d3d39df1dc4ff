//! Messages posted from the page to a specific worker instance.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A page → worker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Let a waiting worker activate without waiting for clients to close.
    SkipWaiting,
}

impl WorkerMessage {
    /// Parse a posted value. Anything unrecognized yields `None`.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Wire form of the message.
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({ "type": self.type_name() })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WorkerMessage::SkipWaiting => "SKIP_WAITING",
        }
    }
}
