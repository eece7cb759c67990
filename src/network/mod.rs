use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{self, Message, MAX_LINE_LENGTH};

/// Run `fut` under an optional deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
    }
}

/// Line-framed control connection.
///
/// Incoming lines are always `\n` framed. Outgoing lines are terminated
/// unless the connection was switched to [`Connection::unterminated`], for
/// remotes that treat each `recv()` as exactly one message.
pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
    peer_addr: SocketAddr,
    timeout: Option<Duration>,
    terminated: bool,
}

impl Connection {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, timeout: Option<Duration>) -> Self {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        Self {
            framed,
            peer_addr,
            timeout,
            terminated: true,
        }
    }

    /// Send each line as a single write with no terminator
    pub fn unterminated(mut self) -> Self {
        self.terminated = false;
        self
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Replace the per-operation deadline
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Send one line
    pub async fn send(&mut self, line: &str) -> Result<()> {
        trace!(peer = %self.peer_addr, line, "send");
        let framed = &mut self.framed;
        if self.terminated {
            return with_timeout(self.timeout, async move {
                framed.send(line).await.map_err(codec_error)
            })
            .await;
        }

        // the codec's write buffer is flushed after every send, so writing
        // past it keeps the byte order
        with_timeout(self.timeout, async move {
            let stream = framed.get_mut();
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Encode and send a command with arguments
    pub async fn send_command(&mut self, command: &str, args: &[&str]) -> Result<()> {
        let line = protocol::encode(command, args)?;
        self.send(&line).await
    }

    /// Receive one raw line, `None` once the remote has closed the stream
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        let framed = &mut self.framed;
        let line = with_timeout(self.timeout, async move {
            framed.next().await.transpose().map_err(codec_error)
        })
        .await?;
        if let Some(ref line) = line {
            trace!(peer = %self.peer_addr, line = line.as_str(), "receive");
        }
        Ok(line)
    }

    /// Receive and decode one message; end-of-stream is an error here
    pub async fn receive(&mut self) -> Result<Message> {
        let line = self.receive_line().await?.ok_or(Error::Disconnected)?;
        Message::parse(&line)
    }

    /// Require the next line to be exactly `token`
    pub async fn expect(&mut self, token: &'static str, context: &'static str) -> Result<()> {
        let line = self.receive_line().await?.unwrap_or_default();
        if line == token {
            Ok(())
        } else {
            Err(Error::Handshake {
                context,
                expected: token,
                got: line,
            })
        }
    }

    /// Flush and shut down the write half, then drop the socket
    pub async fn close(self) -> Result<()> {
        let mut stream = self.framed.into_inner();
        stream.shutdown().await?;
        Ok(())
    }
}

/// Open a raw TCP stream to `host:port`
pub async fn connect_stream(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    with_timeout(timeout, async {
        TcpStream::connect((host, port))
            .await
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })
    })
    .await
}

/// Connect a control channel to a remote host
pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Connection> {
    let stream = connect_stream(host, port, timeout).await?;
    let peer_addr = stream.peer_addr()?;
    Ok(Connection::new(stream, peer_addr, timeout))
}

fn codec_error(err: LinesCodecError) -> Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => Error::LineTooLong,
        LinesCodecError::Io(e) => Error::Io(e),
    }
}
