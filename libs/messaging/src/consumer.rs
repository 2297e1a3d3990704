//! Server side: accepts providers, surfaces their commands, sends responses

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{CommandMessage, CommandResponse};
use courier_fabric::transport::{TcpTransport, TcpTransportListener};
use courier_fabric::{
    Cipher, Connection, ConnectionId, Desync, EventBus, FrameHandler, ReadOptions, WireCodec,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::events::ConsumerEvent;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accepts provider connections and answers their commands
///
/// Every decoded command is published as [`ConsumerEvent::Message`] together
/// with the id of the connection it came in on. Business logic lives with the
/// subscriber, which replies through [`send_response`](Self::send_response).
pub struct MessagingConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    codec: WireCodec,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    events: EventBus<ConsumerEvent>,
    running: Mutex<Option<Running>>,
    stopping: AtomicBool,
}

struct Running {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MessagingConsumer {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                codec: WireCodec::json(cipher),
                connections: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                running: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    /// Bind `host:port` and start accepting
    ///
    /// Returns the bound address, which differs from the requested one when
    /// `port` is zero.
    pub async fn start(&self, host: &str, port: u16, config: ConsumerConfig) -> Result<SocketAddr> {
        let mut running = self.inner.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(Error::AlreadyRunning(current.local_addr.to_string()));
        }

        let listener = TcpTransportListener::bind(host, port)
            .await?
            .with_read_buffer_size(config.read_buffer_size)
            .with_send_timeout(config.send_timeout());
        let local_addr = listener.local_addr()?;
        let log_key = config.log_key.clone().unwrap_or_default();

        info!(log_key = %log_key, %local_addr, "Consumer listening");
        let accept_task = tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            config.read_options(),
            log_key,
        ));

        *running = Some(Running {
            local_addr,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            debug!("Stop requested but the consumer is not running");
            return;
        };

        self.inner.stopping.store(true, Ordering::Release);
        running.accept_task.abort();

        let drained: Vec<_> = self.inner.connections.write().await.drain().collect();
        for (_, connection) in &drained {
            connection.close().await;
        }
        self.inner.stopping.store(false, Ordering::Release);

        info!(
            local_addr = %running.local_addr,
            closed = drained.len(),
            "Consumer stopped"
        );
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Reply on the connection a command arrived on
    ///
    /// [`ConnectionId::NONE`] means the command carried no reply path and
    /// nothing is sent. A connection that has since gone away produces a
    /// [`ConsumerEvent::Warning`], not an error.
    pub async fn send_response(&self, connection: ConnectionId, response: &CommandResponse) {
        if connection.is_none() {
            return;
        }

        let Some(frame) = self.inner.encode(connection, response) else {
            return;
        };

        let connections = self.inner.connections.read().await;
        match connections.get(&connection) {
            Some(target) if target.is_live() => self.inner.deliver(target, &frame).await,
            _ => {
                warn!(%connection, %response, "Response for a connection that is gone");
                self.inner.events.publish(ConsumerEvent::Warning {
                    connection,
                    message: format!(
                        "Connection {} is not active, response {} skipped",
                        connection, response.unique_key
                    ),
                });
            }
        }
    }

    /// Send the same response on every live connection
    pub async fn send_response_to_all(&self, response: &CommandResponse) {
        let Some(frame) = self.inner.encode(ConnectionId::NONE, response) else {
            return;
        };

        let connections = self.inner.connections.read().await;
        for target in connections.values().filter(|c| c.is_live()) {
            self.inner.deliver(target, &frame).await;
        }
    }
}

impl Drop for MessagingConsumer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.running.try_lock() {
            if let Some(running) = running.take() {
                running.accept_task.abort();
            }
        }
        if let Ok(mut connections) = self.inner.connections.try_write() {
            for (_, connection) in connections.drain() {
                connection.abort_reader();
            }
        }
        self.inner.events.close();
    }
}

impl ConsumerInner {
    fn encode(&self, connection: ConnectionId, response: &CommandResponse) -> Option<Vec<u8>> {
        match self.codec.encode(response) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(%connection, %response, error = %e, "Encoding response failed");
                self.events.publish(ConsumerEvent::Error {
                    connection,
                    message: format!("Unable to encode response: {}", e),
                });
                None
            }
        }
    }

    async fn deliver(&self, target: &Connection, frame: &[u8]) {
        if let Err(e) = target.send(frame).await {
            warn!(connection = %target.id(), error = %e, "Sending response failed");
            self.events.publish(ConsumerEvent::Error {
                connection: target.id(),
                message: format!("Unable to send response: {}", e),
            });
        }
    }

    /// Registered before its reader starts, so no command can precede `Accepted`
    async fn register(
        self: &Arc<Self>,
        transport: TcpTransport,
        options: ReadOptions,
        log_key: &str,
    ) {
        let (connection, reader) = Connection::new(transport);
        let id = connection.id();

        // Ids come from a process-wide counter, so a fresh connection never
        // collides with a registered one
        self.connections.write().await.insert(id, connection.clone());

        info!(log_key, connection = %id, peer = connection.peer(), "Connection accepted");
        self.events.publish(ConsumerEvent::Accepted {
            connection: id,
            peer: connection.peer().to_string(),
        });

        let handler = Arc::new(CommandFrames {
            consumer: Arc::downgrade(self),
        });
        connection.spawn_reader(reader, options, handler);
    }

    async fn connection_closed(&self, id: ConnectionId) {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() && !self.stopping.load(Ordering::Acquire) {
            info!(connection = %id, "Connection closed");
            self.events.publish(ConsumerEvent::Closed { connection: id });
        }
    }
}

async fn accept_loop(
    inner: Arc<ConsumerInner>,
    listener: TcpTransportListener,
    options: ReadOptions,
    log_key: String,
) {
    loop {
        match listener.accept().await {
            Ok((transport, _addr)) => inner.register(transport, options, &log_key).await,
            Err(e) => {
                error!(log_key = %log_key, error = %e, "Accept failed");
                inner.events.publish(ConsumerEvent::Error {
                    connection: ConnectionId::NONE,
                    message: format!("Accept failed: {}", e),
                });
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Decodes commands read from one accepted connection
struct CommandFrames {
    consumer: Weak<ConsumerInner>,
}

impl FrameHandler for CommandFrames {
    fn on_frame(&self, connection: &Arc<Connection>, payload: Vec<u8>) {
        let Some(inner) = self.consumer.upgrade() else {
            return;
        };

        match inner.codec.decode::<CommandMessage>(&payload) {
            Ok(message) => {
                debug!(connection = %connection.id(), %message, "Command received");
                inner.events.publish(ConsumerEvent::Message {
                    connection: connection.id(),
                    message,
                });
            }
            Err(e) => {
                error!(
                    connection = %connection.id(),
                    bytes = payload.len(),
                    error = %e,
                    "Dropping undecodable command"
                );
                inner.events.publish(ConsumerEvent::Error {
                    connection: connection.id(),
                    message: format!("Unable to decode command: {}", e),
                });
            }
        }
    }

    fn on_desync(&self, connection: &Arc<Connection>, desync: Desync) {
        if let Some(inner) = self.consumer.upgrade() {
            inner.events.publish(ConsumerEvent::Error {
                connection: connection.id(),
                message: format!("Command stream out of sync: {}", desync),
            });
        }
    }

    fn on_error(&self, connection: &Arc<Connection>, error: courier_fabric::Error) {
        if let Some(inner) = self.consumer.upgrade() {
            inner.events.publish(ConsumerEvent::Error {
                connection: connection.id(),
                message: error.to_string(),
            });
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        if let Some(inner) = self.consumer.upgrade() {
            let id = connection.id();
            tokio::spawn(async move { inner.connection_closed(id).await });
        }
    }
}
