//! Courier Messaging - command/response messaging over the courier fabric
//!
//! - [`MessagingProvider`] sends commands and waits for correlated responses,
//!   over a self-healing persistent connection or one-off ad hoc connections.
//! - [`MessagingConsumer`] accepts providers and hands each decoded command
//!   to its subscribers together with the connection to reply on.
//! - [`RoutingManager`] spreads commands for a service across every consumer
//!   declaring it, preferring the one that has handled the fewest.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier_core::{codes, CommandMessage, CommandResponse, ResponseType};
//! use courier_fabric::PlainCipher;
//! use courier_messaging::{
//!     ConsumerConfig, ConsumerEvent, MessagingConsumer, MessagingProvider, ProviderConfig,
//! };
//!
//! # async fn example() -> courier_messaging::Result<()> {
//! let consumer = MessagingConsumer::new(Arc::new(PlainCipher));
//! let mut inbound = consumer.subscribe();
//! let addr = consumer.start("127.0.0.1", 0, ConsumerConfig::default()).await?;
//!
//! let provider = MessagingProvider::new(ProviderConfig::default(), Arc::new(PlainCipher));
//! provider.connect_persistent("127.0.0.1", addr.port())?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = inbound.recv().await {
//!         if let ConsumerEvent::Message { connection, message } = event {
//!             let reply = CommandResponse::for_message(&message, codes::SUCCESS, ResponseType::Text, "pong");
//!             consumer.send_response(connection, &reply).await;
//!         }
//!     }
//! });
//!
//! let response = provider
//!     .send(CommandMessage::new(1, "health", "ping"), Duration::from_secs(5))
//!     .await;
//! println!("{}", response);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod manager;
pub mod provider;

pub use config::{ConsumerConfig, ConsumerEndpoint, ProviderConfig, RoutingConfig};
pub use consumer::MessagingConsumer;
pub use error::{Error, Result};
pub use events::{ConsumerEvent, ProviderEvent, RoutingEvent};
pub use manager::{parse_services, ConsumerInfo, RoutingManager};
pub use provider::MessagingProvider;
