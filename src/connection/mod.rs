//! Connection module - socket ownership, framing and the free list.
//!
//! A [`Connection`] owns one byte stream (plain TCP, TLS, or an
//! in-memory duplex in tests) together with its frame scanner. Checkout
//! from the pool grants exclusive ownership, so reads and writes need no
//! locking; a connection that saw any failure is marked dead and never
//! reused.

mod listener;
mod pool;

pub use listener::{spawn_listener, CallbackListener};
pub use pool::{ConnectionPool, Connector, PooledClient, TcpConnector};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{ObjwireError, Result};
use crate::protocol::{ConnectionId, Frame, FrameScanner, TagShapes, TaggedValue};

/// Flush threshold while streaming values out.
const WRITE_CHUNK: usize = 8 * 1024;

/// Read buffer size per connection.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Byte stream a connection can own.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// One bridge connection: a byte stream plus framing state.
pub struct Connection {
    stream: Box<dyn Duplex>,
    scanner: FrameScanner,
    /// Shape table shared with the scanner; the write path consults it
    /// so extension values are framed the way the peer will scan them.
    shapes: Arc<TagShapes>,
    /// Frames scanned but not yet consumed (one read may yield several).
    pending: VecDeque<Frame>,
    read_buf: Vec<u8>,
    id: ConnectionId,
    initiated_locally: bool,
    authenticated: bool,
    read_timeout: Option<Duration>,
    dead: bool,
}

impl Connection {
    /// Open an outbound connection per the gateway configuration:
    /// TCP connect under the connect timeout, `TCP_NODELAY`, then the
    /// TLS handshake when configured.
    pub async fn open(config: &GatewayConfig, shapes: Arc<TagShapes>) -> Result<Self> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| ObjwireError::Protocol("No peer address configured".to_string()))?;

        let tcp = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| connect_timed_out())??;
        tcp.set_nodelay(true)?;
        debug!("Connected to {}", address);

        match &config.tls {
            Some(tls) => {
                let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
                let stream = timeout(
                    config.connect_timeout,
                    connector.connect(tls.server_name.clone(), tcp),
                )
                .await
                .map_err(|_| connect_timed_out())??;
                debug!("TLS handshake complete");
                Ok(Self::from_stream(
                    stream,
                    true,
                    shapes,
                    config.max_value_size,
                    config.read_timeout,
                ))
            }
            None => Ok(Self::from_stream(
                tcp,
                true,
                shapes,
                config.max_value_size,
                config.read_timeout,
            )),
        }
    }

    /// Wrap an established stream.
    ///
    /// `initiated_locally` gates the retry policy: only connections this
    /// side opened are ever retried.
    pub fn from_stream<S: Duplex + 'static>(
        stream: S,
        initiated_locally: bool,
        shapes: Arc<TagShapes>,
        max_value_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream: Box::new(stream),
            scanner: FrameScanner::with_max_value_size(shapes.clone(), max_value_size),
            shapes,
            pending: VecDeque::new(),
            read_buf: vec![0u8; READ_BUF_SIZE],
            id: ConnectionId::next(),
            initiated_locally,
            authenticated: false,
            read_timeout,
            dead: false,
        }
    }

    /// Read the next complete frame.
    ///
    /// A read timeout or any transport failure marks the connection
    /// dead. EOF at a frame boundary is [`ObjwireError::ConnectionClosed`];
    /// EOF inside a frame is a protocol error.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }

            let n = match self.read_some().await {
                Ok(n) => n,
                Err(e) => {
                    self.dead = true;
                    return Err(e);
                }
            };
            if n == 0 {
                self.dead = true;
                if self.scanner.is_clean() {
                    return Err(ObjwireError::ConnectionClosed);
                }
                return Err(ObjwireError::Protocol(
                    "Connection closed mid-frame".to_string(),
                ));
            }

            match self.scanner.push(&self.read_buf[..n]) {
                Ok(frames) => self.pending.extend(frames),
                Err(e) => {
                    self.dead = true;
                    return Err(e);
                }
            }
        }
    }

    async fn read_some(&mut self) -> Result<usize> {
        match self.read_timeout {
            Some(limit) => match timeout(limit, self.stream.read(&mut self.read_buf)).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(ObjwireError::ReadTimeout),
            },
            None => Ok(self.stream.read(&mut self.read_buf).await?),
        }
    }

    /// Write a buffered value sequence.
    pub async fn write_values(&mut self, values: &[TaggedValue]) -> Result<()> {
        self.write_stream(values.iter().cloned()).await
    }

    /// Write values as they are produced, flushing in chunks so large
    /// commands never need a full in-memory copy.
    pub async fn write_stream<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = TaggedValue>,
    {
        let mut buf = BytesMut::new();
        for value in values {
            if let Err(e) = value.write_with(&mut buf, &self.shapes) {
                // Earlier chunks of this command may already be on the
                // wire, leaving the peer mid-frame.
                self.dead = true;
                return Err(e);
            }
            if buf.len() >= WRITE_CHUNK {
                self.write_all(&buf).await?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            self.write_all(&buf).await?;
        }
        if let Err(e) = self.stream.flush().await {
            self.dead = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(e) = self.stream.write_all(bytes).await {
            self.dead = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Process-unique connection id, for diagnostics and affinity checks.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether this side opened the connection.
    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    /// Whether the connection saw a failure and must be discarded.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Mark the connection unusable.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Whether the peer has presented a valid token (or none is needed).
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }
}

fn connect_timed_out() -> ObjwireError {
    ObjwireError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "connect timed out",
    ))
}
