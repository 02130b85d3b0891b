//! Frame transport over a duplex byte stream.
//!
//! A [`Connection`] owns the read side of a stream and shares its write side
//! through [`ConnectionHandle`]s. Writes go through a connection-scoped async
//! lock held for the whole frame, so the dispatch loop writing a response and
//! a handler writing push frames never interleave bytes on the wire.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::{FrameReader, FrameWriter};
use crate::types::{Frame, ResponsePayload, into_body};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed connection over a duplex stream.
///
/// There is exactly one reader per connection, enforced by `&mut self` on
/// [`Connection::receive_frame`]. Writers are any number of handles.
pub struct Connection<S> {
    reader: FrameReader<ReadHalf<S>>,
    handle: ConnectionHandle,
    read_timeout: Option<Duration>,
}

impl Connection<TcpStream> {
    /// Opens a TCP connection to the given address.
    pub async fn connect(addr: impl ToSocketAddrs) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream))
    }

    /// Wraps an already connected TCP stream, remembering the peer address.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let mut conn = Self::new(stream);
        conn.handle.peer = peer;
        conn
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a duplex stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);
        Self {
            reader: FrameReader::new(read_half),
            handle: ConnectionHandle {
                writer: Arc::new(Mutex::new(FrameWriter::new(writer))),
                peer: None,
            },
            read_timeout: None,
        }
    }

    /// Builder: fail reads that take longer than `timeout`.
    ///
    /// `None` waits forever for the peer.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Reads the next complete frame.
    pub async fn receive_frame(&mut self) -> ProtocolResult<Frame> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.reader.read_frame())
                .await
                .map_err(|_| ProtocolError::Timeout {
                    operation: "read frame".to_string(),
                })?,
            None => self.reader.read_frame().await,
        }
    }

    /// Writes one complete frame under the connection write lock.
    pub async fn send_frame(&self, frame: &Frame) -> ProtocolResult<()> {
        self.handle.send_frame(frame).await
    }

    /// Writes a response frame under the connection write lock.
    pub async fn send_response(&self, response: &ResponsePayload) -> ProtocolResult<()> {
        self.handle.send_response(response).await
    }

    /// Returns a cloneable handle sharing this connection's write side.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Returns the peer address when the stream is a TCP socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handle.peer
    }

    /// Shuts down the write side, signalling end of stream to the peer.
    pub async fn shutdown(&self) -> ProtocolResult<()> {
        self.handle.shutdown().await
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.handle.peer)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// Shared write side of a [`Connection`].
///
/// Handed to request handlers so they can send push frames while the request
/// is still being processed.
#[derive(Clone)]
pub struct ConnectionHandle {
    writer: Arc<Mutex<FrameWriter<BoxedWriter>>>,
    peer: Option<SocketAddr>,
}

impl ConnectionHandle {
    /// Writes one complete frame, holding the write lock until every byte has
    /// been handed to the stream.
    pub async fn send_frame(&self, frame: &Frame) -> ProtocolResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(frame).await
    }

    /// Writes a response frame.
    pub async fn send_response(&self, response: &ResponsePayload) -> ProtocolResult<()> {
        self.send_frame(&response.to_frame()).await
    }

    /// Sends a push frame (`respTo == -1`) carrying `data`.
    ///
    /// Non-object values are wrapped as `{"result": value}`.
    pub async fn push<T: Serialize>(&self, data: &T) -> ProtocolResult<()> {
        let value = serde_json::to_value(data)?;
        self.send_response(&ResponsePayload::push(into_body(value)))
            .await
    }

    /// Returns the peer address when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
