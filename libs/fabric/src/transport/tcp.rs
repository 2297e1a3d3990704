use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Default size of the per-connection read buffer (1MB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// TCP transport carrying unframed chunks
///
/// Framing is left to [`FrameDecoder`](crate::frame::FrameDecoder); this
/// type only moves bytes.
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    read_buffer_size: usize,
    send_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Connect to `host:port` with no timeouts
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::builder().endpoint(host, port).connect().await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Create from an existing TcpStream
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream,
            peer_addr,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            send_timeout: None,
        }
    }

    /// Set the read buffer size used after splitting
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Bound every write; `None` waits as long as the socket needs
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Get the remote address of this connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr().map_err(Into::into)
    }

    /// Get the local address of this connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr().map_err(Into::into)
    }

    pub fn into_split(self) -> (TcpReader, TcpWriter) {
        let (read, write) = self.stream.into_split();
        (
            TcpReader {
                half: read,
                buffer: vec![0u8; self.read_buffer_size],
            },
            TcpWriter {
                half: write,
                send_timeout: self.send_timeout,
            },
        )
    }
}

impl Transport for TcpTransport {
    fn peer_label(&self) -> String {
        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn split(self) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (reader, writer) = self.into_split();
        (Box::new(reader), Box::new(writer))
    }
}

/// Read half of a [`TcpTransport`]
pub struct TcpReader {
    half: OwnedReadHalf,
    buffer: Vec<u8>,
}

#[async_trait::async_trait]
impl TransportReader for TcpReader {
    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let read = self.half.read(&mut self.buffer).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof
                || e.kind() == std::io::ErrorKind::ConnectionReset
            {
                Error::ConnectionClosed
            } else {
                e.into()
            }
        })?;

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(self.buffer[..read].to_vec())
    }
}

/// Write half of a [`TcpTransport`]
pub struct TcpWriter {
    half: OwnedWriteHalf,
    send_timeout: Option<Duration>,
}

#[async_trait::async_trait]
impl TransportWriter for TcpWriter {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let send_op = async {
            self.half.write_all(bytes).await?;
            self.half.flush().await?;
            Ok::<(), Error>(())
        };

        if let Some(timeout) = self.send_timeout {
            tokio::time::timeout(timeout, send_op)
                .await
                .map_err(|_| Error::SendTimeout(timeout))?
        } else {
            send_op.await
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// TCP listener for accepting incoming connections
pub struct TcpTransportListener {
    listener: TcpListener,
    read_buffer_size: usize,
    send_timeout: Option<Duration>,
}

impl TcpTransportListener {
    /// Bind to a local address
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            send_timeout: None,
        })
    }

    /// Read buffer size given to every accepted transport
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Send timeout given to every accepted transport
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        let transport = TcpTransport::from_stream(stream)
            .with_read_buffer_size(self.read_buffer_size)
            .with_send_timeout(self.send_timeout);
        Ok((transport, addr))
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl crate::transport::TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<Self::Transport> {
        let (transport, _) = TcpTransportListener::accept(self).await?;
        Ok(transport)
    }

    /// Tokio's TcpListener has no explicit close; the socket is released on drop.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builder for configuring TCP transport
#[derive(Default)]
pub struct TcpTransportBuilder {
    endpoint: Option<(String, u16)>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    read_buffer_size: Option<usize>,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host and port to connect to
    pub fn endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint = Some((host.into(), port));
        self
    }

    /// Set the address to connect to
    pub fn address(self, addr: SocketAddr) -> Self {
        self.endpoint(addr.ip().to_string(), addr.port())
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    /// Connect with the configured settings
    pub async fn connect(self) -> Result<TcpTransport> {
        let (host, port) = self
            .endpoint
            .ok_or_else(|| Error::Custom("Address not set".to_string()))?;

        let connect_op = TcpStream::connect((host.as_str(), port));

        let stream = if let Some(timeout) = self.connect_timeout {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| Error::ConnectTimeout(timeout))??
        } else {
            connect_op.await?
        };
        stream.set_nodelay(true)?;

        let mut transport = TcpTransport::from_stream(stream).with_send_timeout(self.send_timeout);
        if let Some(size) = self.read_buffer_size {
            transport = transport.with_read_buffer_size(size);
        }
        Ok(transport)
    }
}
