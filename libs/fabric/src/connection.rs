use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::frame::{Desync, DesyncPolicy, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use crate::transport::{Transport, TransportReader, TransportWriter};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one connection
///
/// `ConnectionId::NONE` (zero) is never assigned; it stands for "no reply path".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const NONE: ConnectionId = ConnectionId(0);

    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receives everything a connection's read loop produces
///
/// Called on the read task, in wire order. Implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    /// One complete frame payload
    fn on_frame(&self, connection: &Arc<Connection>, payload: Vec<u8>);

    /// The decoder dropped its buffer on a bad header
    fn on_desync(&self, connection: &Arc<Connection>, desync: Desync);

    /// Reading failed with something other than a clean close
    fn on_error(&self, connection: &Arc<Connection>, error: Error);

    /// The read loop ended on its own; not called after [`Connection::close`]
    fn on_closed(&self, connection: &Arc<Connection>);
}

/// How a read loop decodes its stream
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub max_frame_len: usize,
    pub desync_policy: DesyncPolicy,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            desync_policy: DesyncPolicy::Discard,
        }
    }
}

/// One live byte stream
///
/// Sends are serialized through an async mutex so every frame goes out as a
/// single uninterrupted write. Reading happens on a dedicated task started by
/// [`spawn_reader`](Self::spawn_reader).
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: tokio::sync::Mutex<Box<dyn TransportWriter>>,
    live: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a transport; reading does not start until `spawn_reader`
    pub fn new<T: Transport>(transport: T) -> (Arc<Self>, Box<dyn TransportReader>) {
        let peer = transport.peer_label();
        let (reader, writer) = transport.split();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            writer: tokio::sync::Mutex::new(writer),
            live: AtomicBool::new(true),
            reader: Mutex::new(None),
        });
        (connection, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Start the read loop, feeding decoded frames to `handler`
    pub fn spawn_reader<H: FrameHandler>(
        self: &Arc<Self>,
        reader: Box<dyn TransportReader>,
        options: ReadOptions,
        handler: Arc<H>,
    ) {
        let task = tokio::spawn(read_loop(self.clone(), reader, options, handler));
        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }
    }

    /// Write one complete frame
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_live() {
            return Err(Error::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.live.store(false, Ordering::Release);
            return Err(e);
        }

        debug!(connection = %self.id, peer = %self.peer, bytes = frame.len(), "Sent frame");
        Ok(())
    }

    /// Stop reading and shut the stream down
    pub async fn close(&self) {
        self.abort_reader();
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(connection = %self.id, error = %e, "Shutdown after close failed");
        }
    }

    /// Mark the connection dead and stop its reader without waiting on I/O
    pub fn abort_reader(&self) {
        self.live.store(false, Ordering::Release);
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("live", &self.is_live())
            .finish()
    }
}

async fn read_loop<H: FrameHandler>(
    connection: Arc<Connection>,
    mut reader: Box<dyn TransportReader>,
    options: ReadOptions,
    handler: Arc<H>,
) {
    let mut decoder = FrameDecoder::with_max_frame_len(options.max_frame_len);

    loop {
        match reader.read_chunk().await {
            Ok(chunk) => {
                let arrival = decoder.feed(&chunk);
                for payload in arrival.frames {
                    handler.on_frame(&connection, payload);
                }

                if let Some(desync) = arrival.desync {
                    error!(
                        connection = %connection.id,
                        peer = %connection.peer,
                        %desync,
                        "Frame stream out of sync, buffered bytes dropped"
                    );
                    handler.on_desync(&connection, desync);
                    if options.desync_policy == DesyncPolicy::Close {
                        break;
                    }
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!(connection = %connection.id, peer = %connection.peer, "Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(connection = %connection.id, peer = %connection.peer, error = %e, "Read failed");
                handler.on_error(&connection, e);
                break;
            }
        }
    }

    connection.live.store(false, Ordering::Release);
    connection.reader.lock().take();
    if let Err(e) = connection.writer.lock().await.close().await {
        debug!(connection = %connection.id, error = %e, "Shutdown after read loop failed");
    }
    handler.on_closed(&connection);
}
