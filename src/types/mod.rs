//! Typed views of QMP payloads.
//!
//! [`crate::Message`] is the untyped unit the protocol moves around; these
//! types decode the parts of it callers usually care about.

mod event;
mod greeting;
mod response;

pub use event::{Event, Timestamp};
pub use greeting::{Greeting, QmpInfo, QmpVersion, QmpVersionNumber};
pub use response::ErrorInfo;

pub(crate) use response::Reply;

use serde::de::DeserializeOwned;

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Decode a whole message into `T`, reporting the failing path.
pub(crate) fn decode_message<T: DeserializeOwned>(msg: &Message, what: &str) -> Result<T> {
    let line = msg.to_bytes()?;
    let mut deserializer = serde_json::Deserializer::from_slice(line);
    serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|e| Error::protocol(format!("malformed {what}: {e}")))
}
