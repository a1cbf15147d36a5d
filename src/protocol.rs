//! Generic session state machine.
//!
//! [`Protocol`] owns one transport at a time and drives it through
//! [`Runstate`]s. Everything specific to a wire protocol (handshake, framing,
//! routing of inbound messages) lives behind the [`Session`] trait; the state
//! machine only knows that messages are read one at a time by a reader task
//! and written one at a time by a writer task.
//!
//! Errors raised by the background tasks are kept until somebody calls
//! [`Protocol::disconnect`], which is the single place they surface.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{
        self, Channel, DEFAULT_MAX_MESSAGE_SIZE, Endpoint, MessageReader, MessageWriter,
        QmpStream, ServerListener,
    },
};

/// Connection lifecycle state.
///
/// Transitions only ever go IDLE → CONNECTING → RUNNING → DISCONNECTING →
/// IDLE; a failed connection attempt goes CONNECTING → DISCONNECTING → IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runstate {
    /// No transport; ready to connect or listen.
    Idle,
    /// Transport setup or handshake in progress.
    Connecting,
    /// Reader and writer tasks are active.
    Running,
    /// Teardown in progress (or finished, awaiting `disconnect()`).
    Disconnecting,
}

impl fmt::Display for Runstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Disconnecting => "DISCONNECTING",
        })
    }
}

/// Protocol-specific behaviour plugged into a [`Protocol`].
///
/// `read_message` and `write_message` are only called with exclusive access
/// to their half of the transport: by `establish` during the handshake, and
/// afterwards by the reader and writer tasks.
pub trait Session: Send + Sync + 'static {
    /// The unit moved by the reader and writer tasks.
    type Message: Send + Sync + 'static;

    /// Handshake over the freshly connected transport, before the reader and
    /// writer tasks start.
    fn establish(&self, channel: &mut Channel) -> impl Future<Output = Result<()>> + Send;

    /// Read one complete message.
    fn read_message(
        &self,
        reader: &mut MessageReader,
    ) -> impl Future<Output = Result<Self::Message>> + Send;

    /// Write one message.
    fn write_message(
        &self,
        writer: &mut MessageWriter,
        msg: &Self::Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Route one inbound message. An error ends the session.
    fn on_message(&self, msg: Self::Message) -> Result<()>;

    /// Longest accepted inbound line.
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    /// Called on the IDLE → CONNECTING transition.
    fn on_connecting(&self) {}

    /// Called once the reader and writer have stopped.
    fn on_teardown(&self) {}

    /// Called on the transition back to IDLE.
    fn on_idle(&self) {}
}

type Outcome = Option<Result<()>>;

/// A session state machine over a stream transport.
///
/// Cloning yields another handle to the same connection. When the last handle
/// is dropped while the connection is not IDLE, the drop is logged as a usage
/// error and the session is torn down on the spot.
pub struct Protocol<S: Session> {
    handle: Arc<Handle<S>>,
}

struct Handle<S: Session> {
    core: Arc<Core<S>>,
}

struct Core<S: Session> {
    session: S,
    name: Option<String>,
    runstate: watch::Sender<Runstate>,
    state: Mutex<State<S::Message>>,
}

struct State<M> {
    /// Abort switch of the connection attempt in progress.
    attempt: Option<CancelToken>,
    server: Option<Arc<ServerListener>>,
    outbound: Option<mpsc::UnboundedSender<M>>,
    reader: Option<JoinHandle<Result<()>>>,
    writer: Option<JoinHandle<Result<()>>>,
    disconnect: Option<PendingDisconnect>,
    next_disconnect: u64,
}

struct PendingDisconnect {
    id: u64,
    /// The connection attempt this teardown cancelled, if any.
    attempt: Option<CancelToken>,
    done: watch::Receiver<Outcome>,
}

struct Teardown<M> {
    outbound: Option<mpsc::UnboundedSender<M>>,
    reader: Option<JoinHandle<Result<()>>>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl<S: Session> Protocol<S> {
    /// Create an IDLE protocol object around `session`.
    ///
    /// `name` is attached to every log record of this connection.
    #[must_use]
    pub fn new(session: S, name: Option<String>) -> Self {
        let (runstate, _) = watch::channel(Runstate::Idle);
        Self {
            handle: Arc::new(Handle {
                core: Arc::new(Core {
                    session,
                    name,
                    runstate,
                    state: Mutex::new(State {
                        attempt: None,
                        server: None,
                        outbound: None,
                        reader: None,
                        writer: None,
                        disconnect: None,
                        next_disconnect: 0,
                    }),
                }),
            }),
        }
    }

    /// The protocol-specific half.
    #[must_use]
    pub fn session(&self) -> &S {
        &self.core().session
    }

    /// Connection nickname used in logs.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.core().name.as_deref()
    }

    /// Current runstate.
    #[must_use]
    pub fn runstate(&self) -> Runstate {
        self.core().runstate()
    }

    /// Wait for the next runstate transition and return the new state.
    ///
    /// Transitions that happen in quick succession may be observed only as
    /// their final state.
    pub async fn runstate_changed(&self) -> Runstate {
        let mut rx = self.core().runstate.subscribe();
        let _ = rx.changed().await;
        let state = *rx.borrow_and_update();
        state
    }

    /// A receiver tracking the runstate from now on.
    #[must_use]
    pub fn subscribe_runstate(&self) -> watch::Receiver<Runstate> {
        self.core().runstate.subscribe()
    }

    /// Connect to `endpoint` as a client and establish the session.
    ///
    /// Requires IDLE. On failure the object is back to IDLE and the cause is
    /// wrapped in [`Error::Connect`]. Dropping the returned future also rolls
    /// the object back to IDLE.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.connect_inner(endpoint, None).await
    }

    /// Like [`connect`](Self::connect), abandoning the attempt when `cancel`
    /// fires. Cancellation is reported as [`Error::Cancelled`], unwrapped.
    pub async fn connect_cancellable(&self, endpoint: &Endpoint, cancel: &CancelToken) -> Result<()> {
        self.connect_inner(endpoint, Some(cancel)).await
    }

    /// Establish the session over an already connected stream.
    pub async fn connect_stream<T>(&self, stream: T) -> Result<()>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let core = self.core();
        let attempt = core.begin()?;
        let rollback = Rollback::new(core, &attempt);
        let result = core
            .establish(Box::new(stream), &attempt)
            .await
            .map_err(|e| Error::connect("Failed to establish session", e));
        rollback.finish(result).await
    }

    async fn connect_inner(&self, endpoint: &Endpoint, cancel: Option<&CancelToken>) -> Result<()> {
        let core = self.core();
        let attempt = core.begin()?;
        let rollback = Rollback::new(core, &attempt);

        #[cfg(feature = "tracing")]
        tracing::debug!(name = ?core.name, %endpoint, "connecting");

        let work = async {
            match transport::connect(endpoint).await {
                Ok(stream) => core
                    .establish(stream, &attempt)
                    .await
                    .map_err(|e| Error::connect("Failed to establish session", e)),
                Err(e) => Err(Error::connect("Failed to establish connection", e)),
            }
        };

        let result = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = work => r,
            },
            None => work.await,
        };
        rollback.finish(result).await
    }

    /// Bind and listen on `endpoint`, returning as soon as the socket is
    /// listening. Moves IDLE → CONNECTING; follow up with
    /// [`accept`](Self::accept).
    pub async fn start_server(&self, endpoint: &Endpoint) -> Result<()> {
        let core = self.core();
        let attempt = core.begin()?;
        let rollback = Rollback::new(core, &attempt);

        let result = match ServerListener::bind(endpoint).await {
            Ok(listener) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(name = ?core.name, %endpoint, "listening");
                core.install_server(listener, &attempt)
            }
            Err(e) => Err(Error::connect("Failed to establish connection", e)),
        };
        rollback.finish(result).await
    }

    /// Wait for a peer on the listening socket, then establish the session.
    ///
    /// Requires CONNECTING after [`start_server`](Self::start_server). When
    /// `timeout` expires, [`Error::Timeout`] is returned and the object stays
    /// listening.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<()> {
        let core = self.core();
        let (server, attempt) = core.pending_server()?;

        let accepted = async {
            tokio::select! {
                biased;
                _ = attempt.cancelled() => Err(Error::Disconnected),
                r = server.accept() => r,
            }
        };
        let accepted = match timeout {
            Some(t) => tokio::time::timeout(t, accepted)
                .await
                .map_err(|_| Error::Timeout { timeout: t })?,
            None => accepted.await,
        };

        let rollback = Rollback::new(core, &attempt);
        let result = match accepted {
            Ok(stream) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(name = ?core.name, "peer connected");
                drop(server);
                core.stop_server();
                core.establish(stream, &attempt)
                    .await
                    .map_err(|e| Error::connect("Failed to establish session", e))
            }
            Err(e) => Err(Error::connect("Failed to establish connection", e)),
        };
        rollback.finish(result).await
    }

    /// [`start_server`](Self::start_server) followed by
    /// [`accept`](Self::accept).
    pub async fn start_server_and_accept(
        &self,
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.start_server(endpoint).await?;
        self.accept(timeout).await
    }

    /// Address of the listening socket between `start_server` and `accept`.
    ///
    /// For TCP this reports the actual port when binding port 0.
    #[must_use]
    pub fn server_endpoint(&self) -> Option<Endpoint> {
        let st = self.core().lock();
        st.server.as_ref().and_then(|s| s.local_endpoint().ok())
    }

    /// Tear the connection down and return to IDLE.
    ///
    /// Safe to call in any state and from several tasks at once: every caller
    /// waits for the same teardown and receives the same outcome. The first
    /// error raised by the reader or writer task, if any, is returned here.
    pub async fn disconnect(&self) -> Result<()> {
        self.core().disconnect().await
    }

    /// Queue `msg` for the writer task.
    ///
    /// Requires RUNNING. Messages are written in the order they are queued.
    pub fn send(&self, msg: S::Message) -> Result<()> {
        self.core().send(msg)
    }

    fn core(&self) -> &Arc<Core<S>> {
        &self.handle.core
    }
}

impl<S: Session> Clone for Protocol<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<S: Session> fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name())
            .field("runstate", &self.runstate())
            .finish()
    }
}

impl<S: Session> Drop for Handle<S> {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl<S: Session> Core<S> {
    fn lock(&self) -> MutexGuard<'_, State<S::Message>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn runstate(&self) -> Runstate {
        *self.runstate.borrow()
    }

    fn set_runstate(&self, state: Runstate) {
        let prev = self.runstate();
        if prev == state {
            return;
        }
        self.runstate.send_replace(state);

        #[cfg(feature = "tracing")]
        tracing::debug!(name = ?self.name, from = %prev, to = %state, "runstate transition");
    }

    fn require(&self, required: Runstate) -> Result<()> {
        let state = self.runstate();
        if state == required {
            Ok(())
        } else {
            Err(Error::State { state, required })
        }
    }

    /// IDLE → CONNECTING; returns the abort switch for this attempt.
    fn begin(&self) -> Result<CancelToken> {
        let mut st = self.lock();
        self.require(Runstate::Idle)?;

        let attempt = CancelToken::new();
        st.attempt = Some(attempt.clone());
        self.session.on_connecting();
        self.set_runstate(Runstate::Connecting);
        Ok(attempt)
    }

    fn install_server(&self, listener: ServerListener, attempt: &CancelToken) -> Result<()> {
        let mut st = self.lock();
        if !st.attempt.as_ref().is_some_and(|a| a.same(attempt)) || attempt.is_cancelled() {
            return Err(Error::connect(
                "Failed to establish connection",
                Error::Disconnected,
            ));
        }
        st.server = Some(Arc::new(listener));
        Ok(())
    }

    fn pending_server(&self) -> Result<(Arc<ServerListener>, CancelToken)> {
        let st = self.lock();
        self.require(Runstate::Connecting)?;
        match (&st.server, &st.attempt) {
            (Some(server), Some(attempt)) => Ok((server.clone(), attempt.clone())),
            _ => Err(Error::protocol(
                "no server is listening; call start_server() first",
            )),
        }
    }

    fn stop_server(&self) {
        self.lock().server = None;
    }

    async fn establish(self: &Arc<Self>, stream: QmpStream, attempt: &CancelToken) -> Result<()> {
        let mut channel = Channel::new(stream, self.session.max_message_size(), attempt.clone());
        self.session.establish(&mut channel).await?;
        self.start_loops(channel, attempt)
    }

    /// CONNECTING → RUNNING: hand the transport to the reader and writer.
    fn start_loops(self: &Arc<Self>, channel: Channel, attempt: &CancelToken) -> Result<()> {
        let mut st = self.lock();
        let current = st.attempt.as_ref().is_some_and(|a| a.same(attempt));
        if !current || attempt.is_cancelled() || self.runstate() != Runstate::Connecting {
            return Err(Error::Disconnected);
        }

        st.attempt = None;
        st.server = None;

        let Channel { reader, writer } = channel;
        let (tx, rx) = mpsc::unbounded_channel();
        st.outbound = Some(tx);
        st.reader = Some(tokio::spawn(reader_loop(self.clone(), reader)));
        st.writer = Some(tokio::spawn(writer_loop(self.clone(), writer, rx)));
        self.set_runstate(Runstate::Running);
        Ok(())
    }

    fn send(&self, msg: S::Message) -> Result<()> {
        let st = self.lock();
        self.require(Runstate::Running)?;
        st.outbound
            .as_ref()
            .ok_or(Error::Disconnected)?
            .send(msg)
            .map_err(|_| Error::Disconnected)
    }

    /// Start a teardown unless one is already running.
    ///
    /// Returns `None` when the object is IDLE and there is nothing to do.
    fn schedule_disconnect(self: &Arc<Self>) -> Option<(u64, watch::Receiver<Outcome>)> {
        let st = self.lock();
        self.schedule_locked(st)
    }

    /// Teardown on behalf of a failed or abandoned connection attempt.
    ///
    /// Only the attempt still in progress starts a teardown; an attempt
    /// already cancelled joins the teardown that cancelled it. A stale
    /// attempt gets `None` and must leave whatever session followed alone.
    fn schedule_rollback(
        self: &Arc<Self>,
        attempt: &CancelToken,
    ) -> Option<(u64, watch::Receiver<Outcome>)> {
        let st = self.lock();
        if let Some(pending) = &st.disconnect {
            let ours = pending.attempt.as_ref().is_some_and(|a| a.same(attempt));
            return ours.then(|| (pending.id, pending.done.clone()));
        }
        if !st.attempt.as_ref().is_some_and(|a| a.same(attempt)) {
            return None;
        }
        self.schedule_locked(st)
    }

    fn schedule_locked(
        self: &Arc<Self>,
        mut st: MutexGuard<'_, State<S::Message>>,
    ) -> Option<(u64, watch::Receiver<Outcome>)> {
        if let Some(pending) = &st.disconnect {
            return Some((pending.id, pending.done.clone()));
        }
        if self.runstate() == Runstate::Idle {
            return None;
        }

        let id = st.next_disconnect;
        st.next_disconnect += 1;
        let (tx, rx) = watch::channel(None);
        let attempt = st.attempt.take();
        if let Some(attempt) = &attempt {
            attempt.cancel();
        }
        st.disconnect = Some(PendingDisconnect {
            id,
            attempt,
            done: rx.clone(),
        });

        if st.server.take().is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!(name = ?self.name, "stopped listening");
        }
        let work = Teardown {
            outbound: st.outbound.take(),
            reader: st.reader.take(),
            writer: st.writer.take(),
        };
        self.set_runstate(Runstate::Disconnecting);
        drop(st);

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let core = self.clone();
                rt.spawn(async move {
                    let outcome = core.teardown(work).await;
                    tx.send_replace(Some(outcome));
                });
            }
            Err(_) => {
                work.abort();
                self.session.on_teardown();
                tx.send_replace(Some(Ok(())));
            }
        }

        Some((id, rx))
    }

    async fn teardown(&self, work: Teardown<S::Message>) -> Result<()> {
        let Teardown {
            outbound,
            reader,
            writer,
        } = work;

        // Closing the queue lets a healthy writer drain what is left, shut
        // the stream down and exit on its own.
        drop(outbound);
        let writer_result = match writer {
            Some(w) => join(w).await,
            None => Ok(()),
        };

        let reader_result = match reader {
            Some(r) => {
                r.abort();
                join(r).await
            }
            None => Ok(()),
        };

        self.session.on_teardown();

        #[cfg(feature = "tracing")]
        tracing::debug!(name = ?self.name, "transport closed");

        reader_result.and(writer_result)
    }

    async fn disconnect(self: &Arc<Self>) -> Result<()> {
        match self.schedule_disconnect() {
            Some((id, done)) => self.await_disconnect(id, done).await,
            None => Ok(()),
        }
    }

    async fn await_disconnect(&self, id: u64, mut done: watch::Receiver<Outcome>) -> Result<()> {
        let outcome = done.wait_for(Option::is_some).await.map(|o| o.clone());
        let outcome = match outcome {
            Ok(Some(outcome)) => outcome,
            // The teardown task went away with its runtime.
            _ => Ok(()),
        };

        self.finish_disconnect(id);
        outcome
    }

    /// DISCONNECTING → IDLE, once per teardown.
    fn finish_disconnect(&self, id: u64) {
        let mut st = self.lock();
        if !st.disconnect.as_ref().is_some_and(|p| p.id == id) {
            return;
        }
        st.disconnect = None;
        self.session.on_idle();
        self.set_runstate(Runstate::Idle);
    }

    /// Synchronous teardown for a dropped protocol object.
    fn abandon(&self) {
        let state = self.runstate();
        if state == Runstate::Idle {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::error!(
            name = ?self.name,
            runstate = %state,
            "protocol object dropped without calling disconnect()"
        );

        let mut st = self.lock();
        if let Some(attempt) = st.attempt.take() {
            attempt.cancel();
        }
        st.server = None;
        let work = Teardown {
            outbound: st.outbound.take(),
            reader: st.reader.take(),
            writer: st.writer.take(),
        };
        st.disconnect = None;
        drop(st);

        work.abort();
        self.session.on_teardown();
        self.session.on_idle();
        self.set_runstate(Runstate::Idle);
    }
}

impl<M> Teardown<M> {
    fn abort(self) {
        drop(self.outbound);
        for task in [self.reader, self.writer].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::protocol(format!("background task failed: {e}"))),
    }
}

async fn reader_loop<S: Session>(core: Arc<Core<S>>, mut reader: MessageReader) -> Result<()> {
    let result: Result<()> = async {
        loop {
            let msg = core.session.read_message(&mut reader).await?;
            core.session.on_message(msg)?;
        }
    }
    .await;

    #[cfg(feature = "tracing")]
    match &result {
        Err(Error::Eof) => tracing::debug!(name = ?core.name, "reader: end of stream"),
        Err(e) => tracing::error!(name = ?core.name, error = %e, "reader failed"),
        Ok(()) => {}
    }

    let requested = core.lock().disconnect.is_some();
    core.schedule_disconnect();
    match result {
        // The peer answering our own shutdown is not an error.
        Err(Error::Eof) if requested => Ok(()),
        other => other,
    }
}

async fn writer_loop<S: Session>(
    core: Arc<Core<S>>,
    mut writer: MessageWriter,
    mut outbound: mpsc::UnboundedReceiver<S::Message>,
) -> Result<()> {
    let result: Result<()> = async {
        while let Some(msg) = outbound.recv().await {
            core.session.write_message(&mut writer, &msg).await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            // The peer may already be gone; a failed shutdown changes nothing.
            if let Err(_e) = writer.close().await {
                #[cfg(feature = "tracing")]
                tracing::trace!(name = ?core.name, error = %_e, "writer: shutdown failed");
            }
            Ok(())
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(name = ?core.name, error = %e, "writer failed");
            core.schedule_disconnect();
            Err(e)
        }
    }
}

/// Rolls a failed or abandoned connection attempt back to IDLE.
struct Rollback<'a, S: Session> {
    core: &'a Arc<Core<S>>,
    attempt: CancelToken,
    armed: bool,
}

impl<'a, S: Session> Rollback<'a, S> {
    fn new(core: &'a Arc<Core<S>>, attempt: &CancelToken) -> Self {
        Self {
            core,
            attempt: attempt.clone(),
            armed: true,
        }
    }

    async fn finish(mut self, result: Result<()>) -> Result<()> {
        self.armed = false;
        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::debug!(name = ?self.core.name, error = %e, "connection attempt failed");
            if let Some((id, done)) = self.core.schedule_rollback(&self.attempt) {
                // The attempt's own error is what the caller needs to see.
                let _ = self.core.await_disconnect(id, done).await;
            }
            return Err(e);
        }
        Ok(())
    }
}

impl<S: Session> Drop for Rollback<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some((id, done)) = self.core.schedule_rollback(&self.attempt) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let core = self.core.clone();
                rt.spawn(async move {
                    let _ = core.await_disconnect(id, done).await;
                });
            }
            // Without a runtime the teardown already ran synchronously.
            Err(_) => self.core.finish_disconnect(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    /// Raw lines, no handshake.
    #[derive(Default)]
    struct Lines {
        hang: bool,
        fail: bool,
        /// Read one line before going RUNNING.
        greet: bool,
        received: Mutex<Vec<Vec<u8>>>,
        teardowns: AtomicUsize,
        idles: AtomicUsize,
    }

    impl Session for Lines {
        type Message = Vec<u8>;

        async fn establish(&self, channel: &mut Channel) -> Result<()> {
            if self.greet {
                channel.reader.read_line().await?;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(Error::protocol("rejected"));
            }
            Ok(())
        }

        async fn read_message(&self, reader: &mut MessageReader) -> Result<Vec<u8>> {
            reader.read_line().await
        }

        async fn write_message(&self, writer: &mut MessageWriter, msg: &Vec<u8>) -> Result<()> {
            writer.write_line(msg).await
        }

        fn on_message(&self, msg: Vec<u8>) -> Result<()> {
            if msg == b"poison" {
                return Err(Error::protocol("poisoned"));
            }
            self.received.lock().unwrap().push(msg);
            Ok(())
        }

        fn on_teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }

        fn on_idle(&self) {
            self.idles.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair(session: Lines) -> (Protocol<Lines>, DuplexStream, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (Protocol::new(session, Some("test".into())), ours, theirs)
    }

    async fn wait_for(p: &Protocol<Lines>, state: Runstate) {
        let mut rx = p.subscribe_runstate();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("runstate timeout")
            .unwrap();
    }

    #[test]
    fn runstate_displays_uppercase() {
        assert_eq!(Runstate::Idle.to_string(), "IDLE");
        assert_eq!(Runstate::Connecting.to_string(), "CONNECTING");
        assert_eq!(Runstate::Running.to_string(), "RUNNING");
        assert_eq!(Runstate::Disconnecting.to_string(), "DISCONNECTING");
    }

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (p, ours, theirs) = pair(Lines::default());
        p.connect_stream(ours).await.unwrap();
        assert_eq!(p.runstate(), Runstate::Running);

        p.send(b"one".to_vec()).unwrap();
        p.send(b"two".to_vec()).unwrap();

        let (r, mut w) = tokio::io::split(theirs);
        let mut lines = BufReader::new(r).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("two"));

        w.write_all(b"three\n").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);
        drop(lines);

        wait_for(&p, Runstate::Disconnecting).await;
        assert_eq!(p.session().received.lock().unwrap().as_slice(), [b"three".to_vec()]);

        // The peer hanging up is reported by disconnect(), once.
        assert!(matches!(p.disconnect().await, Err(Error::Eof)));
        assert_eq!(p.runstate(), Runstate::Idle);
        assert!(p.disconnect().await.is_ok());
        assert_eq!(p.session().teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(p.session().idles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_disconnects_share_the_outcome() {
        let (p, ours, mut theirs) = pair(Lines::default());
        p.connect_stream(ours).await.unwrap();

        theirs.write_all(b"poison\n").await.unwrap();
        wait_for(&p, Runstate::Disconnecting).await;

        let (a, b) = tokio::join!(p.disconnect(), p.disconnect());
        assert!(matches!(a, Err(Error::Protocol { .. })), "{a:?}");
        assert!(matches!(b, Err(Error::Protocol { .. })), "{b:?}");
        assert_eq!(p.runstate(), Runstate::Idle);
        assert_eq!(p.session().idles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_errors_do_no_io() {
        let (p, ours, _theirs) = pair(Lines::default());
        assert!(matches!(
            p.send(b"x".to_vec()),
            Err(Error::State { state: Runstate::Idle, required: Runstate::Running })
        ));
        assert!(matches!(
            p.accept(None).await,
            Err(Error::State { state: Runstate::Idle, required: Runstate::Connecting })
        ));

        p.connect_stream(ours).await.unwrap();
        let (again, _) = tokio::io::duplex(64);
        assert!(matches!(
            p.connect_stream(again).await,
            Err(Error::State { state: Runstate::Running, required: Runstate::Idle })
        ));
        p.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn failed_handshake_rolls_back() {
        let session = Lines {
            fail: true,
            ..Default::default()
        };
        let (p, ours, _theirs) = pair(session);
        let mut states = p.subscribe_runstate();

        let err = p.connect_stream(ours).await.unwrap_err();
        assert!(
            matches!(&err, Error::Connect { message, .. } if message == "Failed to establish session"),
            "{err:?}"
        );
        assert_eq!(p.runstate(), Runstate::Idle);
        assert_eq!(*states.borrow_and_update(), Runstate::Idle);

        // The object is reusable.
        let (p2, ours, _theirs) = pair(Lines::default());
        p2.connect_stream(ours).await.unwrap();
        p2.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connect_future_rolls_back() {
        let session = Lines {
            hang: true,
            ..Default::default()
        };
        let (p, ours, _theirs) = pair(session);

        let res = tokio::time::timeout(Duration::from_millis(20), p.connect_stream(ours)).await;
        assert!(res.is_err());
        wait_for(&p, Runstate::Idle).await;
    }

    #[tokio::test]
    async fn stale_attempt_leaves_the_next_session_alone() {
        let session = Lines {
            greet: true,
            ..Default::default()
        };
        let (p, ours, _theirs) = pair(session);

        // Park the first attempt inside its handshake.
        let mut stale = Box::pin(p.connect_stream(ours));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut stale)
                .await
                .is_err()
        );
        assert_eq!(p.runstate(), Runstate::Connecting);

        p.disconnect().await.unwrap();
        assert_eq!(p.runstate(), Runstate::Idle);

        let (next, mut peer) = tokio::io::duplex(4096);
        peer.write_all(b"hello\n").await.unwrap();
        p.connect_stream(next).await.unwrap();
        assert_eq!(p.runstate(), Runstate::Running);

        // The first attempt now sees its abort and fails on its own.
        let err = stale.await.unwrap_err();
        assert!(matches!(err.root_cause(), Error::Eof), "{err:?}");
        assert_eq!(p.runstate(), Runstate::Running);

        p.send(b"still here".to_vec()).unwrap();
        let mut lines = BufReader::new(peer).lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("still here")
        );
        p.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_stale_attempt_leaves_the_next_session_alone() {
        let session = Lines {
            greet: true,
            ..Default::default()
        };
        let (p, ours, _theirs) = pair(session);

        let mut stale = Box::pin(p.connect_stream(ours));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut stale)
                .await
                .is_err()
        );
        p.disconnect().await.unwrap();

        let (next, mut peer) = tokio::io::duplex(4096);
        peer.write_all(b"hello\n").await.unwrap();
        p.connect_stream(next).await.unwrap();

        drop(stale);
        tokio::task::yield_now().await;
        assert_eq!(p.runstate(), Runstate::Running);
        p.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn accept_timeout_keeps_listening() {
        let (p, _ours, _theirs) = pair(Lines::default());
        p.start_server(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();

        let endpoint = p.server_endpoint().unwrap();
        assert!(matches!(endpoint, Endpoint::Tcp { port, .. } if port != 0));

        let err = p.accept(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
        assert_eq!(p.runstate(), Runstate::Connecting);

        let peer = tokio::spawn(async move { transport::connect(&endpoint).await });
        p.accept(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(p.runstate(), Runstate::Running);
        assert!(p.server_endpoint().is_none());

        drop(peer.await.unwrap().unwrap());
        wait_for(&p, Runstate::Disconnecting).await;
        assert!(matches!(p.disconnect().await, Err(Error::Eof)));
    }

    #[tokio::test]
    async fn disconnect_while_listening() {
        let (p, _ours, _theirs) = pair(Lines::default());
        p.start_server(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();

        let waiter = p.clone();
        let accept = tokio::spawn(async move { waiter.accept(None).await });
        tokio::task::yield_now().await;

        p.disconnect().await.unwrap();
        assert_eq!(p.runstate(), Runstate::Idle);
        let err = accept.await.unwrap().unwrap_err();
        assert!(
            matches!(err, Error::Connect { .. } | Error::State { .. }),
            "{err:?}"
        );
        assert_eq!(p.runstate(), Runstate::Idle);
    }

    #[tokio::test]
    async fn dropping_a_running_protocol_closes_the_transport() {
        let (p, ours, theirs) = pair(Lines::default());
        p.connect_stream(ours).await.unwrap();
        drop(p);

        let mut lines = BufReader::new(theirs).lines();
        let next = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, None);
    }
}
