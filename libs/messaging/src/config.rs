//! Settings for providers, consumers and the routing manager
//!
//! Every struct deserializes with defaults for missing fields, so a TOML file
//! only needs to name what it changes:
//!
//! ```toml
//! [provider]
//! reconnect_backoff_ms = 2000
//! desync_policy = "close"
//!
//! [[consumers]]
//! server = "10.0.0.5"
//! port = 9400
//! services = "billing, invoices"
//! ```

use std::path::Path;
use std::time::Duration;

use courier_fabric::frame::DEFAULT_MAX_FRAME_LEN;
use courier_fabric::transport::tcp::DEFAULT_READ_BUFFER_SIZE;
use courier_fabric::{DesyncPolicy, ReadOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed pause between failed connect attempts
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5000;

/// Waiters preallocated for outstanding sends
pub const DEFAULT_WAITER_POOL_DEPTH: usize = 10;

/// [`MessagingProvider`](crate::MessagingProvider) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Pause before retrying a failed persistent connect
    pub reconnect_backoff_ms: u64,
    /// Give up on a connect attempt after this long; unset waits for the OS
    pub connect_timeout_ms: Option<u64>,
    /// Fail a command whose frame cannot be written within this long
    pub send_timeout_ms: Option<u64>,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    pub waiter_pool_depth: usize,
    /// Largest payload accepted from the consumer
    pub max_frame_len: usize,
    pub desync_policy: DesyncPolicy,
    /// Attached to every log record the provider emits
    pub log_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            connect_timeout_ms: None,
            send_timeout_ms: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            waiter_pool_depth: DEFAULT_WAITER_POOL_DEPTH,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            desync_policy: DesyncPolicy::Discard,
            log_key: None,
        }
    }
}

impl ProviderConfig {
    pub fn with_log_key(mut self, log_key: impl Into<String>) -> Self {
        self.log_key = Some(log_key.into());
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            max_frame_len: self.max_frame_len,
            desync_policy: self.desync_policy,
        }
    }
}

/// [`MessagingConsumer`](crate::MessagingConsumer) configuration, applied
/// to every accepted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub read_buffer_size: usize,
    /// Drop a response whose frame cannot be written within this long
    pub send_timeout_ms: Option<u64>,
    pub max_frame_len: usize,
    pub desync_policy: DesyncPolicy,
    pub log_key: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            send_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            desync_policy: DesyncPolicy::Discard,
            log_key: None,
        }
    }
}

impl ConsumerConfig {
    pub fn with_log_key(mut self, log_key: impl Into<String>) -> Self {
        self.log_key = Some(log_key.into());
        self
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            max_frame_len: self.max_frame_len,
            desync_policy: self.desync_policy,
        }
    }
}

/// One consumer the routing manager should connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerEndpoint {
    pub server: String,
    pub port: u16,
    /// Service names separated by any non-word character
    pub services: String,
}

/// [`RoutingManager`](crate::RoutingManager) configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Settings shared by every consumer's provider
    pub provider: ProviderConfig,
    pub consumers: Vec<ConsumerEndpoint>,
}

impl RoutingConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RoutingConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        for endpoint in &self.consumers {
            if endpoint.server.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Consumer on port {} has no server",
                    endpoint.port
                )));
            }
            if crate::manager::parse_services(&endpoint.services).is_empty() {
                return Err(Error::Config(format!(
                    "Consumer {}:{} declares no services",
                    endpoint.server, endpoint.port
                )));
            }
        }
        Ok(())
    }
}
