//! Asynchronous QMP client.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    events::{EventListener, Events, ListenerGuard},
    message::Message,
    protocol::{Protocol, Runstate, Session},
    transport::{Channel, DEFAULT_MAX_MESSAGE_SIZE, Endpoint, MessageReader, MessageWriter},
    types::{Greeting, Reply},
};

/// Id of the `qmp_capabilities` handshake command.
const NEGOTIATION_ID: &str = "__qmp#00000";

/// Prefix reserved for ids assigned by the client.
const RESERVED_ID_PREFIX: &str = "__qmp#";

/// Options controlling how the QMP session is established.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Wait for the server greeting before starting the session.
    pub await_greeting: bool,

    /// Perform `qmp_capabilities` negotiation. Implies `await_greeting`.
    pub negotiate: bool,

    /// Capabilities to request during negotiation.
    ///
    /// Only those the greeting advertises are actually requested; when none
    /// remain, `qmp_capabilities` is sent without arguments.
    pub enable_capabilities: Vec<String>,

    /// Default timeout for command calls.
    ///
    /// Individual calls can override this via [`CallOptions`].
    pub default_timeout: Option<Duration>,

    /// Longest accepted inbound message, in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            await_greeting: true,
            negotiate: true,
            enable_capabilities: vec!["oob".to_string()],
            default_timeout: Some(Duration::from_secs(30)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Options for a single command call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the default timeout.
    pub timeout: Option<Duration>,

    /// A cancellation token.
    pub cancel: Option<CancelToken>,

    /// Send as `exec-oob` instead of `execute`.
    pub oob: bool,
}

/// QMP client builder.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    name: Option<String>,
    options: ConnectOptions,
}

impl ClientBuilder {
    /// Nickname attached to log records of this connection.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enable or disable `qmp_capabilities` negotiation.
    #[must_use]
    pub fn negotiate(mut self, negotiate: bool) -> Self {
        self.options.negotiate = negotiate;
        self
    }

    /// Enable or disable waiting for the greeting.
    #[must_use]
    pub fn await_greeting(mut self, await_greeting: bool) -> Self {
        self.options.await_greeting = await_greeting;
        self
    }

    /// Set capabilities to request during negotiation.
    #[must_use]
    pub fn enable_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.enable_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Set default command timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Set the longest accepted inbound message.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.options.max_message_size = size;
        self
    }

    /// Build an IDLE client.
    #[must_use]
    pub fn build(self) -> Client {
        Client::with_options(self.name, self.options)
    }

    /// Build a client and connect it to `endpoint`.
    pub async fn connect(self, endpoint: &Endpoint) -> Result<Client> {
        let client = self.build();
        client.connect(endpoint).await?;
        Ok(client)
    }
}

/// An async-first QMP client.
///
/// A `Client` is created IDLE and may be connected, disconnected and
/// reconnected any number of times. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    protocol: Protocol<QmpSession>,
}

type Waiter = oneshot::Sender<Result<Message>>;

/// QMP specifics plugged into the protocol state machine.
struct QmpSession {
    name: Option<String>,
    events: Events,
    options: Mutex<ConnectOptions>,
    greeting: Mutex<Option<Greeting>>,
    negotiated: Mutex<Vec<String>>,
    /// Waiters keyed by the compact JSON text of the reply id; `None` is the
    /// single id-less command allowed in flight.
    pending: Mutex<HashMap<Option<String>, Waiter>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl QmpSession {
    fn new(name: Option<String>, options: ConnectOptions) -> Self {
        Self {
            name,
            events: Events::new(),
            options: Mutex::new(options),
            greeting: Mutex::new(None),
            negotiated: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn options(&self) -> ConnectOptions {
        lock(&self.options).clone()
    }

    fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{RESERVED_ID_PREFIX}{n:05}")
    }

    fn add_pending(&self, key: Option<String>) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(&key) {
            return Err(Error::protocol(match &key {
                Some(id) => format!("message ID {id} is already in use"),
                None => "an id-less command is already in flight".to_string(),
            }));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key, tx);
        Ok(rx)
    }

    fn drop_pending(&self, key: &Option<String>) {
        lock(&self.pending).remove(key);
    }

    /// Reserve `key` until the reply arrives or the caller gives up.
    fn reserve(
        &self,
        key: Option<String>,
    ) -> Result<(PendingReply<'_>, oneshot::Receiver<Result<Message>>)> {
        let rx = self.add_pending(key.clone())?;
        let guard = PendingReply {
            session: self,
            key,
            armed: true,
        };
        Ok((guard, rx))
    }

    async fn read_greeting(&self, reader: &mut MessageReader) -> Result<Greeting> {
        let line = reader
            .read_line()
            .await
            .map_err(|e| Error::greeting("Failed to receive greeting", e))?;
        let greeting = Message::from_bytes(line, true)
            .and_then(|msg| Greeting::try_from(&msg))
            .map_err(|e| Error::greeting("Did not understand greeting", e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            name = ?self.name,
            qemu_major = greeting.qmp.version.qemu.major,
            qemu_minor = greeting.qmp.version.qemu.minor,
            qemu_micro = greeting.qmp.version.qemu.micro,
            caps = ?greeting.qmp.capabilities,
            "received QMP greeting"
        );

        Ok(greeting)
    }

    async fn negotiate(
        &self,
        channel: &mut Channel,
        greeting: &Greeting,
        requested: &[String],
    ) -> Result<Vec<String>> {
        let enable: Vec<String> = requested
            .iter()
            .filter(|cap| greeting.has_capability(cap))
            .cloned()
            .collect();

        let request = build_capabilities_request(&enable);
        let exchange = async {
            channel.writer.write_line(request.to_bytes()?).await?;
            let line = channel.reader.read_line().await?;
            let reply = Message::from_bytes(line, true)?;
            Reply::from_message(&reply)?.into_result("qmp_capabilities")
        };
        exchange
            .await
            .map_err(|e| Error::negotiation("Negotiation failed", e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(name = ?self.name, enabled = ?enable, "capabilities negotiated");

        Ok(enable)
    }
}

/// Releases a reply id when the command future is dropped before its reply
/// arrived (timeout, cancellation, or the caller dropping the future).
struct PendingReply<'a> {
    session: &'a QmpSession,
    key: Option<String>,
    armed: bool,
}

impl PendingReply<'_> {
    /// The reader already removed the entry; the id may be reused by now.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.drop_pending(&self.key);
        }
    }
}

impl Session for QmpSession {
    type Message = Message;

    async fn establish(&self, channel: &mut Channel) -> Result<()> {
        let options = self.options();
        if !(options.await_greeting || options.negotiate) {
            return Ok(());
        }

        let greeting = self.read_greeting(&mut channel.reader).await?;
        *lock(&self.greeting) = Some(greeting.clone());

        if options.negotiate {
            let enabled = self
                .negotiate(channel, &greeting, &options.enable_capabilities)
                .await?;
            *lock(&self.negotiated) = enabled;
        }
        Ok(())
    }

    async fn read_message(&self, reader: &mut MessageReader) -> Result<Message> {
        let line = reader.read_line().await?;
        let msg = Message::from_bytes(line, true)?;

        #[cfg(feature = "tracing")]
        tracing::trace!(name = ?self.name, msg = ?msg, "<-- recv");

        Ok(msg)
    }

    async fn write_message(&self, writer: &mut MessageWriter, msg: &Message) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!(name = ?self.name, msg = ?msg, "--> send");

        writer.write_line(msg.to_bytes()?).await
    }

    fn on_message(&self, msg: Message) -> Result<()> {
        if msg.contains_key("event") {
            #[cfg(feature = "tracing")]
            tracing::debug!(name = ?self.name, event = ?msg.event_name(), "received event");

            self.events.dispatch(&msg);
            return Ok(());
        }

        let key = msg.get("id").map(Value::to_string);
        let waiter = lock(&self.pending).remove(&key);
        match (waiter, key) {
            (Some(tx), _) => {
                // The caller may have given up (timeout, cancellation).
                let _ = tx.send(Ok(msg));
                Ok(())
            }
            (None, None) => Err(Error::protocol(format!(
                "server sent a reply without an ID: {msg:?}"
            ))),
            (None, Some(_id)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(name = ?self.name, id = %_id, "dropping reply for unknown ID");
                Ok(())
            }
        }
    }

    fn max_message_size(&self) -> usize {
        lock(&self.options).max_message_size
    }

    fn on_connecting(&self) {
        *lock(&self.greeting) = None;
        lock(&self.negotiated).clear();
    }

    fn on_teardown(&self) {
        let pending: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(Error::Disconnected));
        }
    }

    fn on_idle(&self) {
        self.events.default_listener().clear();
    }
}

impl Client {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Create an IDLE client with default options.
    #[must_use]
    pub fn new(name: Option<String>) -> Self {
        Self::with_options(name, ConnectOptions::default())
    }

    /// Create an IDLE client.
    #[must_use]
    pub fn with_options(name: Option<String>, options: ConnectOptions) -> Self {
        let session = QmpSession::new(name.clone(), options);
        Self {
            protocol: Protocol::new(session, name),
        }
    }

    /// Connection nickname.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.protocol.name()
    }

    /// Current runstate.
    #[must_use]
    pub fn runstate(&self) -> Runstate {
        self.protocol.runstate()
    }

    /// Wait for the next runstate transition.
    pub async fn runstate_changed(&self) -> Runstate {
        self.protocol.runstate_changed().await
    }

    /// A receiver tracking the runstate from now on.
    #[must_use]
    pub fn subscribe_runstate(&self) -> tokio::sync::watch::Receiver<Runstate> {
        self.protocol.subscribe_runstate()
    }

    /// Connect to a QMP server and perform the handshake.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.protocol.connect(endpoint).await
    }

    /// Connect, giving up with [`Error::Cancelled`] when `cancel` fires.
    pub async fn connect_cancellable(&self, endpoint: &Endpoint, cancel: &CancelToken) -> Result<()> {
        self.protocol.connect_cancellable(endpoint, cancel).await
    }

    /// Perform the handshake over an already connected stream.
    pub async fn connect_stream<T>(&self, stream: T) -> Result<()>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.protocol.connect_stream(stream).await
    }

    /// Listen on `endpoint` for QEMU to connect (`-qmp ...,server=off`).
    pub async fn start_server(&self, endpoint: &Endpoint) -> Result<()> {
        self.protocol.start_server(endpoint).await
    }

    /// Accept one connection on the listening socket and perform the
    /// handshake.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<()> {
        self.protocol.accept(timeout).await
    }

    /// Listen, then accept.
    pub async fn start_server_and_accept(
        &self,
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.protocol.start_server_and_accept(endpoint, timeout).await
    }

    /// Address of the listening socket, while listening.
    #[must_use]
    pub fn server_endpoint(&self) -> Option<Endpoint> {
        self.protocol.server_endpoint()
    }

    /// Disconnect and return to IDLE, reporting the first background error.
    pub async fn disconnect(&self) -> Result<()> {
        self.protocol.disconnect().await
    }

    /// The greeting received during the last handshake.
    #[must_use]
    pub fn greeting(&self) -> Option<Greeting> {
        lock(&self.session().greeting).clone()
    }

    /// Capabilities enabled during the last negotiation.
    #[must_use]
    pub fn negotiated_capabilities(&self) -> Vec<String> {
        lock(&self.session().negotiated).clone()
    }

    /// Timeout applied to calls that do not set their own.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        lock(&self.session().options).default_timeout
    }

    /// Toggle negotiation for subsequent connections.
    pub fn set_negotiate(&self, negotiate: bool) {
        lock(&self.session().options).negotiate = negotiate;
    }

    /// Toggle waiting for the greeting on subsequent connections.
    pub fn set_await_greeting(&self, await_greeting: bool) {
        lock(&self.session().options).await_greeting = await_greeting;
    }

    /// The default catch-all event listener.
    #[must_use]
    pub fn events(&self) -> &Arc<EventListener> {
        self.session().events.default_listener()
    }

    /// The listener registry of this connection.
    #[must_use]
    pub fn event_registry(&self) -> &Events {
        &self.session().events
    }

    /// Register an additional event listener.
    pub fn register_listener(&self, listener: Arc<EventListener>) -> Result<()> {
        self.session().events.register_listener(listener)
    }

    /// Unregister a listener, draining its queue.
    pub fn remove_listener(&self, listener: &Arc<EventListener>) -> Result<()> {
        self.session().events.remove_listener(listener)
    }

    /// Register `listeners` for the lifetime of the returned guard.
    pub fn listen<I>(&self, listeners: I) -> Result<ListenerGuard<'_>>
    where
        I: IntoIterator<Item = Arc<EventListener>>,
    {
        self.session().events.listen(listeners)
    }

    /// Register a fresh listener for `names` for the lifetime of the guard.
    pub fn listener<I, S>(&self, names: I) -> Result<ListenerGuard<'_>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session().events.listener(names)
    }

    /// Execute a QMP command.
    ///
    /// `args` will be serialized into the `arguments` field.
    ///
    /// The return value is deserialized from the QMP `return` field.
    pub async fn execute<A, R>(&self, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.execute_with_options(command, args, CallOptions::default())
            .await
    }

    /// Execute a QMP command with per-call options.
    pub async fn execute_with_options<A, R>(
        &self,
        command: &str,
        args: Option<A>,
        options: CallOptions,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let msg = Self::make_execute_msg(command, args.as_ref(), options.oob)?;
        let reply = self.issue(msg, true, &options).await?;
        let value = Reply::from_message(&reply)?.into_result(command)?;
        deserialize_value(command, value)
    }

    /// Execute a prebuilt `execute` / `exec-oob` message.
    ///
    /// The message must not carry an `id`; one is assigned.
    pub async fn execute_msg(&self, msg: Message) -> Result<Value> {
        let command = msg
            .get_str("execute")
            .or_else(|| msg.get_str("exec-oob"))
            .ok_or_else(|| Error::protocol("message has neither 'execute' nor 'exec-oob'"))?
            .to_string();
        if msg.contains_key("id") {
            return Err(Error::protocol(
                "execute_msg() assigns its own ID; use raw() to send a custom one",
            ));
        }

        let reply = self.issue(msg, true, &CallOptions::default()).await?;
        Reply::from_message(&reply)?.into_result(&command)
    }

    /// Send `msg` and return the reply message as-is.
    ///
    /// With `assign_id` an id is assigned by the client. Otherwise the
    /// message's own `id`, if any, is used for correlation; such ids must not
    /// start with the reserved `__qmp#` prefix, and only one message without
    /// an id may be in flight.
    pub async fn raw(&self, msg: Message, assign_id: bool) -> Result<Message> {
        self.raw_with_options(msg, assign_id, CallOptions::default())
            .await
    }

    /// [`raw`](Self::raw) with per-call options. `options.oob` is ignored;
    /// the message is sent as given.
    pub async fn raw_with_options(
        &self,
        msg: Message,
        assign_id: bool,
        options: CallOptions,
    ) -> Result<Message> {
        if !assign_id {
            if let Some(Value::String(id)) = msg.get("id") {
                if id.starts_with(RESERVED_ID_PREFIX) {
                    return Err(Error::protocol(format!(
                        "ID '{id}' uses the reserved '{RESERVED_ID_PREFIX}' prefix"
                    )));
                }
            }
        }
        self.issue(msg, assign_id, &options).await
    }

    /// Build `{"execute": command, "arguments": args}`, or `exec-oob` when
    /// `oob` is set.
    pub fn make_execute_msg<A: Serialize>(
        command: &str,
        args: Option<&A>,
        oob: bool,
    ) -> Result<Message> {
        let mut obj = Map::new();
        let verb = if oob { "exec-oob" } else { "execute" };
        obj.insert(verb.to_string(), Value::String(command.to_string()));
        if let Some(args) = args {
            obj.insert("arguments".to_string(), serde_json::to_value(args)?);
        }
        Ok(Message::from_map(obj))
    }

    async fn issue(&self, mut msg: Message, assign_id: bool, options: &CallOptions) -> Result<Message> {
        let state = self.runstate();
        if state != Runstate::Running {
            return Err(Error::State {
                state,
                required: Runstate::Running,
            });
        }

        let session = self.session();
        let key = if assign_id {
            let id = Value::String(session.next_id());
            let key = id.to_string();
            msg.insert("id", id)?;
            Some(key)
        } else {
            msg.get("id").map(Value::to_string)
        };

        let (mut guard, mut rx) = session.reserve(key)?;
        self.protocol.send(msg)?;

        let timeout = options.timeout.or(self.default_timeout());
        let reply = tokio::select! {
            biased;
            r = &mut rx => {
                guard.disarm();
                r
            }
            t = expire(timeout) => return Err(Error::Timeout { timeout: t }),
            _ = cancelled(options.cancel.as_ref()) => return Err(Error::Cancelled),
        };

        // Sender dropped without a reply: the session went away.
        reply.unwrap_or(Err(Error::Disconnected))
    }

    fn session(&self) -> &QmpSession {
        self.protocol.session()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("runstate", &self.runstate())
            .finish()
    }
}

async fn expire(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(t) => {
            tokio::time::sleep(t).await;
            t
        }
        None => std::future::pending().await,
    }
}

async fn cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(c) => c.cancelled().await,
        None => std::future::pending().await,
    }
}

fn build_capabilities_request(enable: &[String]) -> Message {
    let mut obj = Map::new();
    obj.insert("execute".to_string(), Value::from("qmp_capabilities"));
    if !enable.is_empty() {
        obj.insert(
            "arguments".to_string(),
            serde_json::json!({ "enable": enable }),
        );
    }
    obj.insert("id".to_string(), Value::from(NEGOTIATION_ID));
    Message::from_map(obj)
}

fn deserialize_value<R: DeserializeOwned>(command: &str, value: Value) -> Result<R> {
    serde_path_to_error::deserialize(value).map_err(|e| {
        Error::protocol(format!("failed to decode response for '{command}': {e}"))
    })
}
