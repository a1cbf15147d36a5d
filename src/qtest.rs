//! Client for QEMU's qtest socket.
//!
//! qtest is a plain line protocol: every command is one line of text and is
//! answered by one line of text.

use std::time::Duration;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{self, Channel, DEFAULT_MAX_MESSAGE_SIZE, Endpoint, QmpStream, ServerListener},
};

/// A connected qtest socket.
#[derive(Debug)]
pub struct QtestClient {
    channel: Channel,
    timeout: Option<Duration>,
}

impl QtestClient {
    /// Connect to a qtest socket QEMU is listening on.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = transport::connect(endpoint).await?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: QmpStream) -> Self {
        Self {
            channel: Channel::new(stream, DEFAULT_MAX_MESSAGE_SIZE, CancelToken::new()),
            timeout: None,
        }
    }

    /// Timeout for each [`cmd`](Self::cmd). After a timeout the stream is
    /// out of step and should be closed.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Send `command` and return the response line, without its newline.
    pub async fn cmd(&mut self, command: &str) -> Result<String> {
        let exchange = async {
            self.channel.writer.write_line(command.as_bytes()).await?;
            let line = self.channel.reader.read_line().await?;
            Ok(String::from_utf8_lossy(&line).into_owned())
        };

        match self.timeout {
            Some(t) => tokio::time::timeout(t, exchange)
                .await
                .map_err(|_| Error::Timeout { timeout: t })?,
            None => exchange.await,
        }
    }

    /// Send `command` without waiting for the response.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        self.channel.writer.write_line(command.as_bytes()).await
    }

    /// Shut the connection down.
    pub async fn close(mut self) -> Result<()> {
        self.channel.writer.close().await
    }
}

/// A listening qtest socket for QEMU to connect to.
#[derive(Debug)]
pub struct QtestServer {
    listener: ServerListener,
}

impl QtestServer {
    /// Bind and listen on `endpoint`.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            listener: ServerListener::bind(endpoint).await?,
        })
    }

    /// The address QEMU should connect to.
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Wait for QEMU to connect, then stop listening.
    pub async fn accept(self, timeout: Option<Duration>) -> Result<QtestClient> {
        let stream = match timeout {
            Some(t) => tokio::time::timeout(t, self.listener.accept())
                .await
                .map_err(|_| Error::Timeout { timeout: t })??,
            None => self.listener.accept().await?,
        };
        Ok(QtestClient::from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cmd_reads_one_line() {
        let server = QtestServer::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let endpoint = server.endpoint().unwrap();

        let peer = tokio::spawn(async move {
            let mut qemu = QtestClient::connect(&endpoint).await.unwrap();
            // The "qemu" side reads a command and answers it.
            let line = qemu.channel.reader.read_line().await.unwrap();
            assert_eq!(line, b"readl 0x1000");
            qemu.send("OK 0x00000000deadbeef").await.unwrap();
        });

        let mut qtest = server.accept(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(
            qtest.cmd("readl 0x1000").await.unwrap(),
            "OK 0x00000000deadbeef"
        );
        peer.await.unwrap();
        qtest.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_times_out() {
        let server = QtestServer::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let err = server
            .accept(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    }
}
