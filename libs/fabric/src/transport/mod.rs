use crate::error::Result;

pub mod tcp;

pub use self::tcp::{TcpReader, TcpTransport, TcpTransportBuilder, TcpTransportListener, TcpWriter};

/// Read side of a connection
///
/// Chunks carry no framing: a frame may span several chunks and a chunk may
/// hold several frames.
#[async_trait::async_trait]
pub trait TransportReader: Send {
    /// Receive the next chunk of bytes, or `Error::ConnectionClosed` at end of stream
    async fn read_chunk(&mut self) -> Result<Vec<u8>>;
}

/// Write side of a connection
#[async_trait::async_trait]
pub trait TransportWriter: Send + Sync {
    /// Write all bytes as one send
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;
}

/// A connected byte stream that can be split into independent halves
pub trait Transport: Send + 'static {
    /// Remote identity for logs
    fn peer_label(&self) -> String;

    fn split(self) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Accepts inbound transports
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport;

    /// Accept an incoming connection
    async fn accept(&self) -> Result<Self::Transport>;

    /// Close the listener
    async fn close(&mut self) -> Result<()>;
}
