use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Error, message::Message};

/// QMP timestamp, typically included in event messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

/// A decoded event.
///
/// This type is intentionally _lossless_:
/// - `name` keeps the original event name.
/// - `data` keeps an arbitrary JSON payload.
///
/// You can deserialize `data` into your own strongly typed struct when needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    #[serde(rename = "event")]
    pub name: String,

    /// Event data payload.
    #[serde(default)]
    pub data: Value,

    /// Optional timestamp.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl TryFrom<&Message> for Event {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        super::decode_message(msg, "event")
    }
}
