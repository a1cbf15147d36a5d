//! Mock QMP peers and transcript replay helpers.
//!
//! This module is intended for:
//! - unit/integration tests
//! - CI regression tests using recorded QMP "conversations"
//!
//! Every peer serves exactly one connection, either by listening
//! ([`MockServer::start_tcp`], [`MockServer::start_unix`]) or by dialing a
//! client that is itself listening ([`MockServer::dial`]).
//!
//! It is gated behind `cfg(test)` or the `mock` Cargo feature.

use std::{collections::HashMap, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{self, Channel, DEFAULT_MAX_MESSAGE_SIZE, Endpoint, QmpStream, ServerListener},
    types::{Greeting, QmpInfo, QmpVersion, QmpVersionNumber},
};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Hang up instead of answering.
    Hangup,
}

impl MockReply {
    fn into_response(self, id: Option<&Value>) -> Option<Value> {
        let mut reply = match self {
            MockReply::Return(v) => serde_json::json!({ "return": v }),
            MockReply::Error { class, desc } => serde_json::json!({
                "error": { "class": class, "desc": desc }
            }),
            MockReply::Hangup => return None,
        };
        if let (Some(id), Some(obj)) = (id, reply.as_object_mut()) {
            obj.insert("id".to_string(), id.clone());
        }
        Some(reply)
    }
}

/// A simple mock script.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send.
    pub greeting: Greeting,

    /// Map from `execute` command name to reply.
    pub replies: HashMap<String, MockReply>,

    /// Events to send right after capabilities negotiation.
    pub post_handshake_events: Vec<Value>,
}

impl MockScript {
    /// Create a default greeting matching a recent QEMU.
    #[must_use]
    pub fn default_greeting() -> Greeting {
        Greeting {
            qmp: QmpInfo {
                version: QmpVersion {
                    qemu: QmpVersionNumber {
                        major: 8,
                        minor: 2,
                        micro: 0,
                    },
                    package: "mock".to_string(),
                },
                capabilities: vec!["oob".to_string()],
            },
        }
    }

    /// Create a script with a default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Self::default_greeting(),
            replies: HashMap::new(),
            post_handshake_events: Vec::new(),
        }
    }

    /// Add a successful reply.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies
            .insert(command.into(), MockReply::Return(value));
        self
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies.insert(
            command.into(),
            MockReply::Error {
                class: class.into(),
                desc: desc.into(),
            },
        );
        self
    }

    /// Hang up when `command` is received.
    #[must_use]
    pub fn hangup_on(mut self, command: impl Into<String>) -> Self {
        self.replies.insert(command.into(), MockReply::Hangup);
        self
    }

    /// Add an event to be sent after negotiation.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mock peer.
///
/// Dropping the last handle shuts it down.
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    shutdown: CancelToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Where the single connection comes from.
enum Link {
    Listen(ServerListener),
    Dial,
}

impl MockServer {
    /// Start a TCP mock server on 127.0.0.1:0 (ephemeral port).
    pub async fn start_tcp(script: MockScript) -> Result<Self> {
        Self::listen(&Endpoint::tcp("127.0.0.1", 0), script).await
    }

    /// Start a Unix mock server at the given path.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<Path>, script: MockScript) -> Result<Self> {
        Self::listen(&Endpoint::unix(path.as_ref()), script).await
    }

    /// Connect to a client listening at `endpoint` and serve it.
    pub fn dial(endpoint: Endpoint, script: MockScript) -> Self {
        spawn_peer(endpoint, Link::Dial, move |channel| {
            serve_script(channel, script)
        })
    }

    async fn listen(endpoint: &Endpoint, script: MockScript) -> Result<Self> {
        let listener = ServerListener::bind(endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        Ok(spawn_peer(endpoint, Link::Listen(listener), move |channel| {
            serve_script(channel, script)
        }))
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Wait for the peer to finish on its own and report how it went.
    pub async fn finished(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        match task.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(Error::protocol(format!("mock peer failed: {e}")))),
            None => Ok(()),
        }
    }

    /// Shut down the peer and wait for completion.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let _ = self.finished().await;
    }
}

fn spawn_peer<F, Fut>(endpoint: Endpoint, link: Link, serve: F) -> MockServer
where
    F: FnOnce(Channel) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let shutdown = CancelToken::new();
    let token = shutdown.clone();
    let target = endpoint.clone();

    let task = tokio::spawn(async move {
        let stream: QmpStream = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            s = open(&target, link) => s?,
        };
        let channel = Channel::new(stream, DEFAULT_MAX_MESSAGE_SIZE, token.clone());
        serve(channel).await
    });

    MockServer {
        inner: Arc::new(Inner {
            endpoint,
            shutdown,
            task: Mutex::new(Some(task)),
        }),
    }
}

async fn open(endpoint: &Endpoint, link: Link) -> Result<QmpStream> {
    match link {
        // The listener is dropped (and a Unix path unlinked) once one peer is
        // accepted.
        Link::Listen(listener) => listener.accept().await,
        Link::Dial => transport::connect(endpoint).await,
    }
}

async fn serve_script(mut ch: Channel, mut script: MockScript) -> Result<()> {
    send_json(&mut ch, &serde_json::to_value(&script.greeting)?).await?;

    let mut negotiated = false;
    loop {
        let req = match recv_json(&mut ch).await {
            Ok(v) => v,
            Err(Error::Eof) => return Ok(()),
            Err(e) => return Err(e),
        };

        let id = req.get("id");
        let execute = req
            .get("execute")
            .or_else(|| req.get("exec-oob"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if !negotiated {
            let reply = if execute == "qmp_capabilities" {
                MockReply::Return(serde_json::json!({}))
            } else {
                MockReply::Error {
                    class: "CommandNotFound".to_string(),
                    desc: "Expecting capabilities negotiation with 'qmp_capabilities'"
                        .to_string(),
                }
            };
            if let Some(reply) = reply.into_response(id) {
                send_json(&mut ch, &reply).await?;
            }
            if execute == "qmp_capabilities" {
                negotiated = true;
                for ev in std::mem::take(&mut script.post_handshake_events) {
                    send_json(&mut ch, &ev).await?;
                }
            }
            continue;
        }

        let reply = script
            .replies
            .get(&execute)
            .cloned()
            .unwrap_or_else(|| MockReply::Error {
                class: "CommandNotFound".to_string(),
                desc: format!("The command {execute} has not been found"),
            });

        match reply.into_response(id) {
            Some(reply) => send_json(&mut ch, &reply).await?,
            None => return Ok(()),
        }
    }
}

async fn send_json(ch: &mut Channel, msg: &Value) -> Result<()> {
    ch.writer.write_line(msg.to_string().as_bytes()).await
}

async fn recv_json(ch: &mut Channel) -> Result<Value> {
    let line = ch.reader.read_line().await?;
    Ok(serde_json::from_slice(&line)?)
}

/// A transcript step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript, suitable for replay.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step: TranscriptStep = serde_json::from_str(line).map_err(|e| {
                Error::protocol(format!("invalid jsonl at line {}: {}", idx + 1, e))
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_jsonl_str(&data)
    }
}

/// Replay a transcript by acting as a QMP peer.
///
/// The peer sends/receives messages exactly as the transcript lists them, then hangs up. An
/// empty transcript hangs up right after the connection is made.
#[derive(Debug)]
pub struct ReplayServer {
    server: MockServer,
}

impl ReplayServer {
    /// Start a replay server on TCP.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        Self::listen(&Endpoint::tcp("127.0.0.1", 0), transcript).await
    }

    /// Start a replay server on a Unix socket.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<Path>, transcript: Transcript) -> Result<Self> {
        Self::listen(&Endpoint::unix(path.as_ref()), transcript).await
    }

    /// Connect to a client listening at `endpoint` and replay to it.
    pub fn dial(endpoint: Endpoint, transcript: Transcript) -> Self {
        Self {
            server: spawn_peer(endpoint, Link::Dial, move |channel| {
                replay_connection(channel, transcript)
            }),
        }
    }

    async fn listen(endpoint: &Endpoint, transcript: Transcript) -> Result<Self> {
        let listener = ServerListener::bind(endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        Ok(Self {
            server: spawn_peer(endpoint, Link::Listen(listener), move |channel| {
                replay_connection(channel, transcript)
            }),
        })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.server.endpoint()
    }

    /// Wait for the replay to complete; fails on a transcript mismatch.
    pub async fn finished(&self) -> Result<()> {
        self.server.finished().await
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        self.server.shutdown().await
    }
}

async fn replay_connection(mut ch: Channel, transcript: Transcript) -> Result<()> {
    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => {
                send_json(&mut ch, &msg).await?;
            }
            TranscriptStep::Client { msg: expected } => {
                let got = recv_json(&mut ch).await?;

                if got != expected {
                    return Err(Error::protocol(format!(
                        "transcript mismatch: expected {expected}, got {got}"
                    )));
                }
            }
        }
    }

    let _ = ch.writer.close().await;
    Ok(())
}
