use std::sync::Arc;

use courier_core::{CommandMessage, CommandResponse};
use courier_fabric::ConnectionId;

use crate::manager::ConsumerInfo;

/// Lifecycle of a [`MessagingProvider`](crate::MessagingProvider)
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The persistent connection was established
    Connected,
    /// The persistent connection went away; a reconnect follows
    Closed,
    Error { message: String },
    /// A response arrived that no caller was waiting for
    Unsolicited(CommandResponse),
}

/// Lifecycle of a [`MessagingConsumer`](crate::MessagingConsumer)
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Accepted {
        connection: ConnectionId,
        peer: String,
    },
    Closed {
        connection: ConnectionId,
    },
    /// `connection` is [`ConnectionId::NONE`] for listener failures
    Error {
        connection: ConnectionId,
        message: String,
    },
    /// Expected but noteworthy, e.g. a reply to a peer that already left
    Warning {
        connection: ConnectionId,
        message: String,
    },
    /// A decoded command; reply with
    /// [`send_response`](crate::MessagingConsumer::send_response)
    Message {
        connection: ConnectionId,
        message: CommandMessage,
    },
}

/// A provider event tagged with the consumer whose provider raised it
#[derive(Debug, Clone)]
pub struct RoutingEvent {
    pub consumer: Arc<ConsumerInfo>,
    pub event: ProviderEvent,
}
