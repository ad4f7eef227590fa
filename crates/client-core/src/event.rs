use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Generic wire event envelope shared by every dispatch path.
///
/// Only `type` is required; everything else is tolerated as absent so a
/// single sparse event cannot jam the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Dotted event type, e.g. `m.room.member`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload; an empty object when the server sent none.
    #[serde(default = "empty_object")]
    pub content: Value,
    /// Content the event replaced, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<Value>,
    /// Acting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Subject slot for state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Wall-clock milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

impl EventEnvelope {
    /// Parse an envelope out of a raw JSON event.
    pub fn from_value(value: Value) -> Result<Self, ClientError> {
        serde_json::from_value(value)
            .map_err(|err| ClientError::protocol(format!("malformed event envelope: {err}")))
    }

    /// Whether the event pins a slot in room state.
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// String field of `content`, when present and a string.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}
