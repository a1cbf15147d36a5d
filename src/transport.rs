//! Socket transport and line framing.

use std::{fmt, path::PathBuf, str::FromStr};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
};

/// Default limit for a single inbound line.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// QMP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// A TCP socket.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse an address string.
    ///
    /// An address with exactly one colon is `"host:port"` and becomes a TCP
    /// endpoint; anything else (no colon, or several) is a Unix socket path.
    /// A non-numeric port fails with [`Error::BadPort`].
    pub fn parse(address: &str) -> Result<Self> {
        match address.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| Error::BadPort {
                    port: port.to_string(),
                })?;
                Ok(Self::tcp(host, port))
            }
            _ => Ok(Self::unix(address)),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "{}", path.display()),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Trait object representing an async stream that can be used for QMP I/O.
pub trait AsyncQmpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncQmpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected stream.
///
/// Internally this is a boxed stream so the rest of the crate does not care
/// whether the underlying connection is Unix or TCP.
pub type QmpStream = Box<dyn AsyncQmpStream>;

/// Connect to an endpoint.
pub(crate) async fn connect(endpoint: &Endpoint) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let s = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            // Best effort: disable Nagle for request/response latency.
            let _ = s.set_nodelay(true);
            Ok(Box::new(s))
        }
    }
}

/// A bound, listening socket awaiting one peer.
#[derive(Debug)]
pub(crate) enum ServerListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl ServerListener {
    /// Bind and listen on `endpoint`.
    ///
    /// A stale Unix socket left at the path is replaced.
    pub(crate) async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                remove_stale_socket(path);
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(Error::protocol(
                "unix sockets are not supported on this platform",
            )),
            Endpoint::Tcp { host, port } => {
                let listener = tokio::net::TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self::Tcp(listener))
            }
        }
    }

    /// The address peers should connect to.
    pub(crate) fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::unix(path.clone())),
        }
    }

    /// Wait for one peer.
    pub(crate) async fn accept(&self) -> Result<QmpStream> {
        match self {
            Self::Tcp(listener) => {
                let (s, _peer) = listener.accept().await?;
                let _ = s.set_nodelay(true);
                Ok(Box::new(s))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (s, _addr) = listener.accept().await?;
                Ok(Box::new(s))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for ServerListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Newline-delimited reader half of a connection.
pub struct MessageReader {
    inner: BufReader<ReadHalf<QmpStream>>,
    limit: usize,
    abort: CancelToken,
}

impl MessageReader {
    pub(crate) fn new(inner: ReadHalf<QmpStream>, limit: usize, abort: CancelToken) -> Self {
        Self {
            inner: BufReader::new(inner),
            limit,
            abort,
        }
    }

    /// Read one line, without its terminator.
    ///
    /// End of stream (including a final line with no terminator, or a local
    /// abort of the connection attempt) is reported as [`Error::Eof`]; socket
    /// failures as [`Error::Io`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let limit = self.limit as u64 + 1;
        let mut bounded = (&mut self.inner).take(limit);

        let n = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(Error::Eof),
            n = bounded.read_until(b'\n', &mut buf) => n?,
        };

        if n == 0 {
            return Err(Error::Eof);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > self.limit {
                return Err(Error::protocol(format!(
                    "message exceeds the {} byte limit",
                    self.limit
                )));
            }
            return Err(Error::Eof);
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }
}

impl fmt::Debug for MessageReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReader")
            .field("limit", &self.limit)
            .finish()
    }
}

/// Writer half of a connection.
pub struct MessageWriter {
    w: WriteHalf<QmpStream>,
}

impl MessageWriter {
    pub(crate) fn new(w: WriteHalf<QmpStream>) -> Self {
        Self { w }
    }

    /// Write `line` followed by a newline, then flush.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.w.write_all(line).await?;
        self.w.write_all(b"\n").await?;
        self.w.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write direction.
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.w.flush().await?;
        self.w.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWriter").finish()
    }
}

/// Both halves of a connection, as handed to a session handshake.
#[derive(Debug)]
pub struct Channel {
    /// Inbound half.
    pub reader: MessageReader,
    /// Outbound half.
    pub writer: MessageWriter,
}

impl Channel {
    pub(crate) fn new(stream: QmpStream, limit: usize, abort: CancelToken) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(r, limit, abort),
            writer: MessageWriter::new(w),
        }
    }
}
