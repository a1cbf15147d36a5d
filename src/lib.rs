//! `aqmp` - Asynchronous QEMU Machine Protocol (QMP) client library.
//!
//! It provides:
//! - a reusable connection state machine ([`Protocol`]) with an observable
//!   [`Runstate`] (IDLE, CONNECTING, RUNNING, DISCONNECTING)
//! - client and server roles over Unix or TCP sockets
//! - greeting + `qmp_capabilities` negotiation
//! - command/reply correlation with typed (serde) return values
//! - filtered event listeners with queues and history
//! - a blocking wrapper ([`legacy`]) and a qtest socket client ([`qtest`])
//!
//! ## Quick start (Unix socket)
//!
//! ```no_run
//! use aqmp::{Client, Endpoint};
//! # async fn demo() -> aqmp::Result<()> {
//! let client = Client::new(Some("vm0".into()));
//! client.connect(&Endpoint::unix("/var/run/qemu-server/100.qmp")).await?;
//!
//! let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
//! println!("status = {status}");
//!
//! // Wait for the guest to power off.
//! let guard = client.listener(["SHUTDOWN"])?;
//! let event = guard.listener().get().await;
//! println!("event: {event}");
//! drop(guard);
//!
//! client.disconnect().await?;
//! # Ok(()) }
//! ```
//!
//! ## Background errors
//!
//! Failures of the reader or writer task (the peer hanging up, a malformed
//! message) end the session and are reported by the next
//! [`Client::disconnect`] call. Pending commands fail with
//! [`Error::Disconnected`] as soon as the session is torn down.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod client;

pub mod error;
pub mod events;
pub mod legacy;
pub mod message;
pub mod protocol;
pub mod qtest;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cancel::CancelToken;
pub use client::{CallOptions, Client, ClientBuilder, ConnectOptions};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventListener, Events, ListenerGuard};
pub use message::Message;
pub use protocol::{Protocol, Runstate, Session};
pub use transport::Endpoint;
