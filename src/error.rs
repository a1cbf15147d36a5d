//! Error model for the `aqmp` crate.
//!
//! Every failure is a variant of [`Error`]. Connection-phase failures wrap
//! exactly one root cause, so `Error::Connect` around `Error::Greeting`
//! around `Error::Eof` is how "the peer hung up before greeting us" reads.

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::protocol::Runstate;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Establishing the connection or session failed.
    Connect,
    /// The greeting or capabilities negotiation failed.
    Handshake,
    /// The operation is not permitted in the current runstate.
    State,
    /// Bytes on the wire were not a JSON object.
    Format,
    /// The listener registration API was misused.
    Listener,
    /// An I/O level failure (socket, EOF, etc.).
    Io,
    /// A malformed address.
    Address,
    /// QMP protocol violation or unexpected message.
    Protocol,
    /// QMP returned an error object.
    Qmp,
    /// The connection was closed.
    Disconnected,
    /// The call timed out.
    Timeout,
    /// The call was cancelled.
    Cancelled,
}

/// Structured error type.
///
/// Foreign sources are held behind `Arc` so that an error produced by a
/// background task can be handed to every caller waiting on the same
/// teardown.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection or session could not be established.
    ///
    /// The state machine has already been rolled back to IDLE.
    #[error("{message}: {source}")]
    Connect {
        /// What was being attempted.
        message: String,
        /// Root cause.
        #[source]
        source: Box<Error>,
    },

    /// The server greeting was missing or could not be understood.
    #[error("{message}: {source}")]
    Greeting {
        /// What went wrong.
        message: String,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// `qmp_capabilities` negotiation failed.
    #[error("{message}: {source}")]
    Negotiation {
        /// What went wrong.
        message: String,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The operation requires a different runstate.
    #[error("operation requires runstate {required}, but the connection is {state}")]
    State {
        /// Current runstate.
        state: Runstate,
        /// Required runstate.
        required: Runstate,
    },

    /// Bytes were not valid JSON.
    #[error("failed to deserialize QMP message: {source}")]
    Deserialization {
        /// The offending bytes (lossily decoded).
        raw: String,
        /// Lower-level error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Bytes were valid JSON, but not a JSON object.
    #[error("QMP message is not a JSON object (got {found})")]
    UnexpectedType {
        /// JSON type that was found at the top level.
        found: &'static str,
    },

    /// JSON serialization error for outbound data.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Misuse of the event listener registry.
    #[error("listener error: {message}")]
    Listener {
        /// Human readable message.
        message: String,
    },

    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The stream ended.
    #[error("end of stream")]
    Eof,

    /// A `host:port` address had a non-numeric port.
    #[error("bad port in address: {port:?}")]
    BadPort {
        /// The port segment as given.
        port: String,
    },

    /// The QMP peer sent an unexpected or invalid message.
    #[error("QMP protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// QMP returned an error for an `execute` request.
    #[error("QMP command failed: {class}: {desc}")]
    Qmp {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// The connection closed while a request was in-flight.
    #[error("QMP connection closed")]
    Disconnected,

    /// A blocking wait exceeded its timeout.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// A call was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Json {
            source: Arc::new(source),
        }
    }
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Greeting { .. } | Self::Negotiation { .. } => ErrorKind::Handshake,
            Self::State { .. } => ErrorKind::State,
            Self::Deserialization { .. } | Self::UnexpectedType { .. } | Self::Json { .. } => {
                ErrorKind::Format
            }
            Self::Listener { .. } => ErrorKind::Listener,
            Self::Io { .. } | Self::Eof => ErrorKind::Io,
            Self::BadPort { .. } => ErrorKind::Address,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Qmp { .. } => ErrorKind::Qmp,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Follows `Connect`, `Greeting` and `Negotiation` wrappers down to the
    /// innermost cause.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Connect { source, .. }
            | Self::Greeting { source, .. }
            | Self::Negotiation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn connect(message: impl Into<String>, source: Error) -> Self {
        Self::Connect {
            message: message.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn greeting(message: impl Into<String>, source: Error) -> Self {
        Self::Greeting {
            message: message.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn negotiation(message: impl Into<String>, source: Error) -> Self {
        Self::Negotiation {
            message: message.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn listener(message: impl Into<String>) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    pub(crate) fn qmp(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::Qmp {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }
}
