//! Blocking facade over [`Client`].
//!
//! [`QemuMonitorProtocol`] owns a private tokio runtime with one worker
//! thread, so events keep arriving in the background between calls. It must
//! not be used from inside an async context.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::{
    client::{CallOptions, Client, ConnectOptions},
    error::{Error, Result},
    message::Message,
    protocol::Runstate,
    transport::Endpoint,
    types::Greeting,
};

/// How long [`QemuMonitorProtocol::pull_event`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately.
    No,
    /// Block until an event arrives.
    Forever,
    /// Block for at most this long, then fail with [`Error::Timeout`].
    Timeout(Duration),
}

impl From<bool> for Wait {
    fn from(wait: bool) -> Self {
        if wait { Self::Forever } else { Self::No }
    }
}

/// Synchronous QMP connection.
pub struct QemuMonitorProtocol {
    client: Client,
    endpoint: Endpoint,
    timeout: Option<Duration>,
    runtime: tokio::runtime::Runtime,
}

impl QemuMonitorProtocol {
    /// Create a connection object for `endpoint`.
    ///
    /// With `server` set, the socket is bound and listening when this
    /// returns; call [`accept`](Self::accept) next. Otherwise call
    /// [`connect`](Self::connect).
    pub fn new(endpoint: Endpoint, server: bool, name: Option<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("qmp-legacy")
            .enable_all()
            .build()?;

        // Command deadlines come from `set_timeout` alone.
        let client = Client::with_options(
            name,
            ConnectOptions {
                default_timeout: None,
                ..ConnectOptions::default()
            },
        );
        if server {
            runtime.block_on(client.start_server(&endpoint))?;
        }

        Ok(Self {
            client,
            endpoint,
            timeout: None,
            runtime,
        })
    }

    /// Parse `"host:port"` or a Unix socket path.
    pub fn parse_address(address: &str) -> Result<Endpoint> {
        Endpoint::parse(address)
    }

    /// The underlying asynchronous client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connect to the server.
    ///
    /// Returns the greeting when `negotiate` is set; without negotiation the
    /// greeting is not read at all.
    pub fn connect(&self, negotiate: bool) -> Result<Option<Greeting>> {
        self.client.set_await_greeting(negotiate);
        self.client.set_negotiate(negotiate);
        self.runtime.block_on(self.client.connect(&self.endpoint))?;
        Ok(if negotiate { self.client.greeting() } else { None })
    }

    /// Wait for QEMU to connect to the listening socket.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Greeting> {
        self.client.set_await_greeting(true);
        self.client.set_negotiate(true);
        self.runtime.block_on(self.client.accept(timeout))?;
        self.client
            .greeting()
            .ok_or_else(|| Error::protocol("session established without a greeting"))
    }

    /// Send a raw message and return the raw reply.
    ///
    /// A message without an `id` gets one assigned.
    pub fn cmd_obj(&self, msg: Message) -> Result<Message> {
        let assign_id = !msg.contains_key("id");
        self.runtime
            .block_on(self.client.raw_with_options(msg, assign_id, self.call_options()))
    }

    /// Build and send `{"execute": name, "arguments": args, "id": id}`,
    /// returning the raw reply.
    pub fn cmd(&self, name: &str, args: Option<Value>, id: Option<Value>) -> Result<Message> {
        let mut obj = Map::new();
        obj.insert("execute".to_string(), Value::from(name));
        if let Some(args) = args {
            obj.insert("arguments".to_string(), args);
        }
        if let Some(id) = id {
            obj.insert("id".to_string(), id);
        }
        self.cmd_obj(Message::from_map(obj))
    }

    /// Execute `name` and return its `return` value.
    pub fn command(&self, name: &str, args: Option<Value>) -> Result<Value> {
        self.runtime
            .block_on(self.client.execute_with_options(name, args, self.call_options()))
    }

    /// Pop the oldest pending event.
    ///
    /// With [`Wait::No`] this returns `Ok(None)` when nothing is pending.
    pub fn pull_event(&self, wait: impl Into<Wait>) -> Result<Option<Message>> {
        let events = self.client.events();
        if let Some(event) = events.try_get() {
            return Ok(Some(event));
        }

        match wait.into() {
            Wait::No => Ok(None),
            Wait::Forever => Ok(Some(self.runtime.block_on(events.get()))),
            Wait::Timeout(t) => self
                .runtime
                .block_on(async { tokio::time::timeout(t, events.get()).await })
                .map(Some)
                .map_err(|_| Error::Timeout { timeout: t }),
        }
    }

    /// Drain all pending events.
    ///
    /// When nothing is pending and `wait` allows it, blocks for the next one.
    pub fn get_events(&self, wait: impl Into<Wait>) -> Result<Vec<Message>> {
        let mut events = self.client.events().clear();
        let wait = wait.into();
        if events.is_empty() && wait != Wait::No {
            events.extend(self.pull_event(wait)?);
        }
        Ok(events)
    }

    /// Discard all pending events.
    pub fn clear_events(&self) {
        self.client.events().clear();
    }

    /// Timeout applied to subsequent command calls. `None` (the default)
    /// blocks until the reply arrives or the connection drops.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Disconnect, reporting the first background error, if any.
    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.client.disconnect())
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.timeout,
            ..CallOptions::default()
        }
    }
}

impl Drop for QemuMonitorProtocol {
    fn drop(&mut self) {
        if self.client.runstate() == Runstate::Idle {
            return;
        }
        // Blocking is only possible outside of another runtime.
        if tokio::runtime::Handle::try_current().is_err() {
            let _ = self.runtime.block_on(self.client.disconnect());
        }
    }
}

impl std::fmt::Debug for QemuMonitorProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QemuMonitorProtocol")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("client", &self.client)
            .finish()
    }
}
