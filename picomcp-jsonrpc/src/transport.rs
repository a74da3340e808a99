//! In this crate a "transport" is the byte pipe a session talks over, usually an accepted TCP
//! socket.
//!
//! The [`Transport`] trait is deliberately small: read whatever bytes are available, write bytes,
//! report whether the connection is still up, and close it.  Framing is not the transport's
//! concern; [`Peer`] layers a [`FrameCodec`] and an accumulation buffer on top of any transport and
//! hands out whole messages.
//!
//! Timeouts are applied by [`Peer`] rather than by each transport.  A receive timeout only means
//! "nothing arrived yet"; a send timeout is fatal, because a half-written frame cannot be safely
//! retried.
use std::borrow::Cow;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::framing::FrameCodec;
use crate::{JsonRpcError, Result};

/// Largest number of bytes pulled from the transport in one read.
pub const READ_CHUNK_LEN: usize = 1024;

/// Outcome of a single [`Transport::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were appended to the buffer.
    Data(usize),
    /// Nothing is available right now; the connection is still healthy.
    WouldBlock,
    /// The peer closed its end of the connection.
    Closed,
}

/// A byte-level connection to the remote peer.
pub trait Transport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport-specific identifier of the remote peer, useful for logging and debugging.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// Append whatever bytes are available to `buf`.
    ///
    /// Must be cancel-safe: if the future is dropped before completing, no bytes may be lost.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut BytesMut,
    ) -> impl Future<Output = Result<ReadOutcome, Self::Error>> + Send + 'a;

    /// Write all of `bytes`, looping over partial writes, or fail.
    fn write_all<'a>(&'a mut self, bytes: &'a [u8]) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    fn is_connected(&self) -> bool;

    /// Close the connection.  Errors while closing are not interesting to anyone.
    fn close(&mut self) -> impl Future<Output = ()> + Send + '_;
}

/// [`Transport`] over anything that implements [`tokio::io::AsyncRead`] and
/// [`tokio::io::AsyncWrite`]: TCP sockets in production, in-memory duplex pipes in tests.
pub struct StreamTransport<Io> {
    io: Io,
    remote_peer: String,
    connected: bool,
}

impl<Io> StreamTransport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: Io, remote_peer: impl Into<String>) -> Self {
        Self {
            io,
            remote_peer: remote_peer.into(),
            connected: true,
        }
    }
}

impl StreamTransport<TcpStream> {
    /// Wrap an accepted TCP connection, naming the peer by its socket address.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let remote_peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(err = %e, %remote_peer, "Failed to disable Nagle's algorithm");
        }
        Self::new(stream, remote_peer)
    }
}

impl<Io> Transport for StreamTransport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Error = std::io::Error;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Owned(self.remote_peer.clone())
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut BytesMut,
    ) -> impl Future<Output = Result<ReadOutcome, Self::Error>> + Send + 'a {
        async move {
            let mut chunk = [0u8; READ_CHUNK_LEN];
            // `AsyncReadExt::read` is cancel safe, and nothing touches `buf` until it completes
            match self.io.read(&mut chunk).await {
                Ok(0) => {
                    self.connected = false;
                    Ok(ReadOutcome::Closed)
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    Ok(ReadOutcome::Data(n))
                }
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) => {
                    Ok(ReadOutcome::WouldBlock)
                }
                Err(e) => {
                    self.connected = false;
                    Err(e)
                }
            }
        }
    }

    fn write_all<'a>(&'a mut self, bytes: &'a [u8]) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        async move {
            let result = async {
                self.io.write_all(bytes).await?;
                self.io.flush().await
            }
            .await;
            if result.is_err() {
                self.connected = false;
            }
            result
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            self.connected = false;
            if let Err(e) = self.io.shutdown().await {
                tracing::debug!(err = %e, remote_peer = %self.remote_peer, "Error shutting down stream");
            }
        }
    }
}

/// What [`Peer::receive`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One complete message.
    Message(String),
    /// No complete message yet; poll again.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// A transport plus the framing state needed to exchange whole messages over it.
///
/// The peer owns the transport exclusively and closes it at most once.
pub struct Peer<T: Transport> {
    transport: T,
    codec: FrameCodec,
    buffer: BytesMut,
    remote_peer: String,
    closed: bool,
}

impl<T: Transport> Peer<T> {
    pub fn new(transport: T, codec: FrameCodec) -> Self {
        let remote_peer = transport.remote_peer().into_owned();
        Self {
            transport,
            buffer: BytesMut::with_capacity(READ_CHUNK_LEN),
            codec,
            remote_peer,
            closed: false,
        }
    }

    /// Return the remote peer's identifier, which is transport-specific.
    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.transport.is_connected()
    }

    /// Number of bytes received but not yet framed into a message.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Return the next complete message, waiting at most `timeout` for more bytes.
    ///
    /// A message already sitting in the buffer is returned without touching the transport.  At
    /// most one read is issued per call, so a caller polling in a loop gets at most one message
    /// per iteration.  This is cancel-safe.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Received> {
        if self.closed {
            return Ok(Received::Closed);
        }

        if let Some(message) = self.codec.decode(&mut self.buffer)? {
            return Ok(Received::Message(message));
        }

        match tokio::time::timeout(timeout, self.transport.read(&mut self.buffer)).await {
            Err(_elapsed) => Ok(Received::Idle),
            Ok(Ok(ReadOutcome::WouldBlock)) => Ok(Received::Idle),
            Ok(Ok(ReadOutcome::Data(n))) => {
                tracing::trace!(bytes = n, buffered = self.buffer.len(), "Read from transport");
                match self.codec.decode(&mut self.buffer)? {
                    Some(message) => Ok(Received::Message(message)),
                    None => Ok(Received::Idle),
                }
            }
            Ok(Ok(ReadOutcome::Closed)) => {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        remote_peer = %self.remote_peer,
                        discarded = self.buffer.len(),
                        "Peer closed the connection mid-frame"
                    );
                    self.buffer.clear();
                }
                Ok(Received::Closed)
            }
            Ok(Err(e)) => Err(JsonRpcError::Transport { source: Box::new(e) }),
        }
    }

    /// Frame `message` and write it out in full, or fail.
    ///
    /// Nothing is written if framing fails.  Exceeding `timeout` is reported as
    /// [`JsonRpcError::SendTimeout`]; the caller must treat the connection as unusable afterward
    /// since part of the frame may already be on the wire.
    pub async fn send(&mut self, message: &str, timeout: Duration) -> Result<()> {
        if !self.is_connected() {
            return Err(JsonRpcError::ConnectionClosed);
        }

        let mut frame = BytesMut::with_capacity(message.len() + 4);
        self.codec.encode(message, &mut frame)?;

        match tokio::time::timeout(timeout, self.transport.write_all(&frame)).await {
            Err(_elapsed) => Err(JsonRpcError::SendTimeout { timeout }),
            Ok(Err(e)) => Err(JsonRpcError::Transport { source: Box::new(e) }),
            Ok(Ok(())) => {
                tracing::trace!(bytes = frame.len(), "Wrote frame to transport");
                Ok(())
            }
        }
    }

    /// Close the transport.  Only the first call has any effect.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
