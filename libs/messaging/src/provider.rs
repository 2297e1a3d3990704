//! Client side: sends commands to a consumer and waits for their responses

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{codes, CommandMessage, CommandResponse, ResponseType};
use courier_fabric::transport::TcpTransport;
use courier_fabric::{
    Cipher, Connection, CorrelationTable, Desync, EventBus, FrameHandler, WireCodec,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::events::ProviderEvent;

pub const NOT_WAITING_TEXT: &str = "Command Message Sent. Not Waiting For Response";
pub const TIMED_OUT_TEXT: &str = "Timed Out Waiting For Response";
pub const INACTIVE_TEXT: &str = "Connection Is Not Active";

/// Sends [`CommandMessage`]s and correlates the [`CommandResponse`]s
///
/// A provider either keeps one persistent connection, re-established in the
/// background whenever it drops, or opens a short-lived connection per
/// [`send_ad_hoc`](Self::send_ad_hoc) call. Both share one correlation table,
/// so a response is matched by its unique key regardless of the connection it
/// came back on.
///
/// Sends never fail: problems come back as responses carrying one of the
/// [`codes`] constants.
pub struct MessagingProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    config: ProviderConfig,
    log_key: String,
    codec: WireCodec,
    correlation: CorrelationTable,
    connection: Mutex<Option<Arc<Connection>>>,
    events: EventBus<ProviderEvent>,
    reconnect: Notify,
    disposed: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingProvider {
    pub fn new(config: ProviderConfig, cipher: Arc<dyn Cipher>) -> Self {
        let log_key = config.log_key.clone().unwrap_or_default();
        let correlation = CorrelationTable::with_pool_depth(config.waiter_pool_depth);
        Self {
            inner: Arc::new(ProviderInner {
                config,
                log_key,
                codec: WireCodec::json(cipher),
                correlation,
                connection: Mutex::new(None),
                events: EventBus::new(),
                reconnect: Notify::new(),
                disposed: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> UnboundedReceiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    /// Keep a connection to `server:port` open until disposed
    ///
    /// Returns immediately; the first attempt runs in the background. Failed
    /// attempts raise [`ProviderEvent::Error`] and are retried after the
    /// configured backoff, indefinitely.
    pub fn connect_persistent(&self, server: impl Into<String>, port: u16) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::Disposed);
        }

        let server = server.into();
        let mut task = self.inner.reconnect_task.lock();
        if task.is_some() {
            return Err(Error::AlreadyRunning(format!("{}:{}", server, port)));
        }

        info!(log_key = %self.inner.log_key, %server, port, "Starting persistent connection");
        *task = Some(tokio::spawn(reconnect_loop(self.inner.clone(), server, port)));
        Ok(())
    }

    /// Whether the persistent connection is currently up
    pub fn is_connected(&self) -> bool {
        self.inner.live_connection().is_some()
    }

    /// Send over the persistent connection
    ///
    /// A zero `wait` is fire-and-forget: the call returns an acknowledgment
    /// with code [`codes::SUCCESS`] as soon as the frame is written, and any
    /// response the consumer sends later surfaces as
    /// [`ProviderEvent::Unsolicited`]. Otherwise the call waits at most
    /// `wait`; a [`codes::TIMED_OUT`] response means the outcome is unknown,
    /// not that the command failed.
    pub async fn send(&self, message: CommandMessage, wait: Duration) -> CommandResponse {
        self.send_with(message, wait, || {}).await
    }

    /// [`send`](Self::send), calling `dispatched` once the frame is written
    ///
    /// `dispatched` runs before the wait for the response starts and never
    /// runs when the command could not be written.
    pub async fn send_with<F>(
        &self,
        message: CommandMessage,
        wait: Duration,
        dispatched: F,
    ) -> CommandResponse
    where
        F: FnOnce() + Send,
    {
        match self.inner.live_connection() {
            Some(connection) => self.inner.exchange(&connection, message, wait, dispatched).await,
            None => {
                warn!(log_key = %self.inner.log_key, %message, "Send without an active connection");
                CommandResponse::for_message(
                    &message,
                    codes::CONNECTION_INACTIVE,
                    ResponseType::Text,
                    INACTIVE_TEXT,
                )
            }
        }
    }

    /// Send over a connection opened for this one exchange
    ///
    /// The connection is closed once the response arrives or the wait
    /// expires, so a response arriving after a timeout is lost.
    pub async fn send_ad_hoc(
        &self,
        server: &str,
        port: u16,
        message: CommandMessage,
        wait: Duration,
    ) -> CommandResponse {
        if self.inner.is_disposed() {
            return CommandResponse::for_message(
                &message,
                codes::CONNECTION_INACTIVE,
                ResponseType::Text,
                INACTIVE_TEXT,
            );
        }

        let connection = match self.inner.open(server, port, false).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(log_key = %self.inner.log_key, server, port, error = %e, "Ad hoc connect failed");
                return send_failed(&message, &e);
            }
        };

        let response = self.inner.exchange(&connection, message, wait, || {}).await;
        connection.close().await;
        response
    }

    /// Stop reconnecting and close the persistent connection
    ///
    /// Safe to call more than once. Subscribers see their event stream end.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(log_key = %self.inner.log_key, "Disposing provider");
        self.inner.stop_reconnecting();

        let connection = self.inner.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.inner.events.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Sends currently awaiting a response
    pub fn awaiting(&self) -> usize {
        self.inner.correlation.awaiting()
    }
}

impl Drop for MessagingProvider {
    fn drop(&mut self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.stop_reconnecting();
        if let Some(connection) = self.inner.connection.lock().take() {
            connection.abort_reader();
        }
        self.inner.events.close();
    }
}

impl ProviderInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn live_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .as_ref()
            .filter(|connection| connection.is_live())
            .cloned()
    }

    fn stop_reconnecting(&self) {
        self.reconnect.notify_one();
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    async fn open(self: &Arc<Self>, server: &str, port: u16, persistent: bool) -> Result<Arc<Connection>> {
        let mut builder = TcpTransport::builder()
            .endpoint(server, port)
            .read_buffer_size(self.config.read_buffer_size);
        if let Some(timeout) = self.config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.config.send_timeout() {
            builder = builder.send_timeout(timeout);
        }

        let transport = builder.connect().await?;
        let (connection, reader) = Connection::new(transport);
        let handler = Arc::new(ResponseFrames {
            provider: Arc::downgrade(self),
            persistent,
        });
        connection.spawn_reader(reader, self.config.read_options(), handler);

        debug!(
            log_key = %self.log_key,
            connection = %connection.id(),
            peer = connection.peer(),
            persistent,
            "Connection opened"
        );
        Ok(connection)
    }

    async fn exchange<F>(
        &self,
        connection: &Connection,
        mut message: CommandMessage,
        wait: Duration,
        dispatched: F,
    ) -> CommandResponse
    where
        F: FnOnce() + Send,
    {
        message.ensure_unique_key();
        debug!(log_key = %self.log_key, %message, wait_ms = wait.as_millis() as u64, "Sending command");

        let frame = match self.codec.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(log_key = %self.log_key, %message, error = %e, "Encoding command failed");
                return send_failed(&message, &e);
            }
        };

        if wait.is_zero() {
            return match connection.send(&frame).await {
                Ok(()) => {
                    dispatched();
                    CommandResponse::for_message(
                        &message,
                        codes::SUCCESS,
                        ResponseType::Text,
                        NOT_WAITING_TEXT,
                    )
                }
                Err(e) => {
                    warn!(log_key = %self.log_key, %message, error = %e, "Send failed");
                    send_failed(&message, &e)
                }
            };
        }

        // Bound before the write so a fast response always finds its waiter
        let pending = match self.correlation.acquire(message.unique_key) {
            Ok(pending) => pending,
            Err(e) => return send_failed(&message, &e),
        };

        if let Err(e) = connection.send(&frame).await {
            warn!(log_key = %self.log_key, %message, error = %e, "Send failed");
            return send_failed(&message, &e);
        }
        dispatched();

        let response = pending.wait_timeout(wait).await;
        self.correlation.release(pending);

        match response {
            Some(response) => {
                debug!(log_key = %self.log_key, %response, "Response received");
                response
            }
            None => {
                warn!(log_key = %self.log_key, %message, "Timed out waiting for response");
                CommandResponse::for_message(
                    &message,
                    codes::TIMED_OUT,
                    ResponseType::Text,
                    TIMED_OUT_TEXT,
                )
            }
        }
    }

    fn connection_closed(&self, connection: &Arc<Connection>) {
        let was_current = {
            let mut slot = self.connection.lock();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };

        if was_current && !self.is_disposed() {
            info!(log_key = %self.log_key, peer = connection.peer(), "Persistent connection closed");
            self.events.publish(ProviderEvent::Closed);
            self.reconnect.notify_one();
        }
    }

    fn raise_error(&self, message: String) {
        self.events.publish(ProviderEvent::Error { message });
    }
}

fn send_failed(message: &CommandMessage, error: &dyn std::fmt::Display) -> CommandResponse {
    CommandResponse::for_message(
        message,
        codes::SEND_FAILED,
        ResponseType::Text,
        error.to_string(),
    )
}

async fn reconnect_loop(inner: Arc<ProviderInner>, server: String, port: u16) {
    let backoff = inner.config.reconnect_backoff();

    while !inner.is_disposed() {
        match inner.open(&server, port, true).await {
            Ok(connection) => {
                {
                    // Checked under the slot lock: dispose sets the flag before
                    // it empties the slot
                    let mut slot = inner.connection.lock();
                    if inner.is_disposed() {
                        connection.abort_reader();
                        break;
                    }
                    *slot = Some(connection);
                }
                info!(log_key = %inner.log_key, %server, port, "Connected");
                inner.events.publish(ProviderEvent::Connected);

                // The connection may already be gone if the peer hung up at once
                while !inner.is_disposed() && inner.live_connection().is_some() {
                    inner.reconnect.notified().await;
                }
            }
            Err(e) => {
                error!(
                    log_key = %inner.log_key,
                    %server,
                    port,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Connect failed"
                );
                inner.raise_error(format!("Unable to connect to {}:{}: {}", server, port, e));

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = inner.reconnect.notified() => {}
                }
            }
        }
    }

    debug!(log_key = %inner.log_key, %server, port, "Reconnect loop stopped");
}

/// Decodes responses read from one of the provider's connections
struct ResponseFrames {
    provider: Weak<ProviderInner>,
    persistent: bool,
}

impl FrameHandler for ResponseFrames {
    fn on_frame(&self, connection: &Arc<Connection>, payload: Vec<u8>) {
        let Some(inner) = self.provider.upgrade() else {
            return;
        };

        match inner.codec.decode::<CommandResponse>(&payload) {
            Ok(response) => {
                if let Some(unsolicited) = inner.correlation.deliver(response) {
                    info!(log_key = %inner.log_key, response = %unsolicited, "Unsolicited response");
                    inner.events.publish(ProviderEvent::Unsolicited(unsolicited));
                }
            }
            Err(e) => {
                error!(
                    log_key = %inner.log_key,
                    connection = %connection.id(),
                    bytes = payload.len(),
                    error = %e,
                    "Dropping undecodable response"
                );
                inner.raise_error(format!("Unable to decode response: {}", e));
            }
        }
    }

    fn on_desync(&self, _connection: &Arc<Connection>, desync: Desync) {
        if let Some(inner) = self.provider.upgrade() {
            inner.raise_error(format!("Response stream out of sync: {}", desync));
        }
    }

    fn on_error(&self, _connection: &Arc<Connection>, error: courier_fabric::Error) {
        if let Some(inner) = self.provider.upgrade() {
            inner.raise_error(error.to_string());
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        if !self.persistent {
            return;
        }
        if let Some(inner) = self.provider.upgrade() {
            inner.connection_closed(connection);
        }
    }
}
