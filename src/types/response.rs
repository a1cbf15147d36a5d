use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    message::Message,
};

/// The `error` object returned by QMP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class.
    pub class: String,
    /// Error description.
    pub desc: String,
}

/// A command reply, reduced to its outcome.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Return(Value),
    Error(ErrorInfo),
}

impl Reply {
    /// Classify a reply message.
    ///
    /// Exactly one of `return` / `error` must be present.
    pub(crate) fn from_message(msg: &Message) -> Result<Self> {
        match (msg.get("return"), msg.get("error")) {
            (Some(value), None) => Ok(Self::Return(value.clone())),
            (None, Some(error)) => serde_json::from_value::<ErrorInfo>(error.clone())
                .map(Self::Error)
                .map_err(|e| Error::protocol(format!("malformed error reply: {e}"))),
            (Some(_), Some(_)) => Err(Error::protocol(
                "reply carries both 'return' and 'error'",
            )),
            (None, None) => Err(Error::protocol("missing 'return' field in response")),
        }
    }

    /// The `return` value, or the error as [`Error::Qmp`].
    pub(crate) fn into_result(self, command: &str) -> Result<Value> {
        match self {
            Self::Return(value) => Ok(value),
            Self::Error(err) => Err(Error::qmp(command, err.class, err.desc)),
        }
    }
}
