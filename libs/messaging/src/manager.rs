//! Service-name routing across several consumers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{codes, CommandMessage, CommandResponse};
use courier_fabric::{Cipher, EventBus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, RoutingConfig};
use crate::error::{Error, Result};
use crate::events::{ProviderEvent, RoutingEvent};
use crate::provider::MessagingProvider;

/// Split a service declaration on every non-word character
///
/// Word characters are ASCII letters, digits and `_`. Empty fragments are
/// dropped, so `"billing, invoices;;reports"` yields three services.
pub fn parse_services(services: &str) -> Vec<String> {
    services
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|fragment| !fragment.is_empty())
        .map(str::to_owned)
        .collect()
}

/// One consumer endpoint and the provider connected to it
pub struct ConsumerInfo {
    server: String,
    port: u16,
    services: Vec<String>,
    message_count: AtomicU64,
    provider: MessagingProvider,
}

impl ConsumerInfo {
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Exact, case-sensitive match
    pub fn serves(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    /// Commands dispatched to this consumer so far; never decreases
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn increment_message_count(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn provider(&self) -> &MessagingProvider {
        &self.provider
    }
}

impl fmt::Debug for ConsumerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerInfo")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("services", &self.services)
            .field("message_count", &self.message_count())
            .field("connected", &self.provider.is_connected())
            .finish()
    }
}

impl fmt::Display for ConsumerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server[{}] Port[{}] Services[{}] Messages[{}]",
            self.server,
            self.port,
            self.services.join(","),
            self.message_count()
        )
    }
}

/// Routes commands by service name to the least used consumer
///
/// Each registered consumer gets its own persistent [`MessagingProvider`].
/// Their events are re-published, tagged with the consumer, through
/// [`subscribe`](Self::subscribe).
pub struct RoutingManager {
    provider_config: ProviderConfig,
    cipher: Arc<dyn Cipher>,
    consumers: RwLock<Vec<Arc<ConsumerInfo>>>,
    events: Arc<EventBus<RoutingEvent>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingManager {
    pub fn new(provider_config: ProviderConfig, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            provider_config,
            cipher,
            consumers: RwLock::new(Vec::new()),
            events: Arc::new(EventBus::new()),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Build a manager and register every configured consumer
    pub fn from_config(config: &RoutingConfig, cipher: Arc<dyn Cipher>) -> Result<Self> {
        let manager = Self::new(config.provider.clone(), cipher);
        for endpoint in &config.consumers {
            manager.add_consumer(&endpoint.server, endpoint.port, &endpoint.services)?;
        }
        Ok(manager)
    }

    pub fn subscribe(&self) -> UnboundedReceiver<RoutingEvent> {
        self.events.subscribe()
    }

    /// Register a consumer serving the services in `services`
    ///
    /// A persistent connection is started right away; commands routed here
    /// before it is up come back with [`codes::CONNECTION_INACTIVE`].
    pub fn add_consumer(&self, server: &str, port: u16, services: &str) -> Result<Arc<ConsumerInfo>> {
        let services = parse_services(services);
        if services.is_empty() {
            return Err(Error::Config(format!(
                "Consumer {}:{} declares no services",
                server, port
            )));
        }

        let provider = MessagingProvider::new(self.provider_config.clone(), self.cipher.clone());
        let provider_events = provider.subscribe();
        let consumer = Arc::new(ConsumerInfo {
            server: server.to_owned(),
            port,
            services,
            message_count: AtomicU64::new(0),
            provider,
        });

        let forwarder = tokio::spawn(forward_events(
            Arc::downgrade(&consumer),
            provider_events,
            self.events.clone(),
        ));
        self.forwarders.lock().push(forwarder);

        consumer.provider.connect_persistent(server, port)?;

        info!(consumer = %consumer, "Consumer added");
        self.consumers.write().push(consumer.clone());
        Ok(consumer)
    }

    /// Snapshot of the registered consumers, in registration order
    pub fn consumers(&self) -> Vec<Arc<ConsumerInfo>> {
        self.consumers.read().clone()
    }

    /// The consumer serving `service` with the lowest message count
    ///
    /// Ties go to the consumer registered first.
    pub fn select_consumer(&self, service: &str) -> Option<Arc<ConsumerInfo>> {
        self.consumers
            .read()
            .iter()
            .filter(|consumer| consumer.serves(service))
            .min_by_key(|consumer| consumer.message_count())
            .cloned()
    }

    /// Send through the least used consumer serving `service`
    ///
    /// The consumer's count goes up as soon as the command is written, so
    /// callers routing while this one still waits already see it. Fails only
    /// when no consumer serves `service`; every other problem comes back as
    /// a response code, as with [`MessagingProvider::send`].
    pub async fn send_message(
        &self,
        service: &str,
        message: CommandMessage,
        wait: Duration,
    ) -> Result<CommandResponse> {
        let consumer = self
            .select_consumer(service)
            .ok_or_else(|| Error::NoConsumer(service.to_owned()))?;

        debug!(service, consumer = %consumer, %message, "Routing command");
        let response = consumer
            .provider
            .send_with(message, wait, || {
                consumer.increment_message_count();
            })
            .await;

        if codes::is_undelivered(response.response_code) {
            warn!(service, consumer = %consumer, %response, "Command was not delivered");
        }
        Ok(response)
    }

    /// Dispose every consumer's provider
    pub async fn dispose(&self) {
        let consumers: Vec<_> = self.consumers.write().drain(..).collect();
        for consumer in &consumers {
            consumer.provider.dispose().await;
        }
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
        self.events.close();
        info!(disposed = consumers.len(), "Routing manager disposed");
    }
}

impl Drop for RoutingManager {
    fn drop(&mut self) {
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
    }
}

async fn forward_events(
    consumer: Weak<ConsumerInfo>,
    mut events: UnboundedReceiver<ProviderEvent>,
    bus: Arc<EventBus<RoutingEvent>>,
) {
    while let Some(event) = events.recv().await {
        let Some(consumer) = consumer.upgrade() else {
            break;
        };
        bus.publish(RoutingEvent { consumer, event });
    }
}
