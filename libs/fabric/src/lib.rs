//! Courier Fabric - framed, encrypted byte streams
//!
//! Moves [`CommandMessage`](courier_core::CommandMessage)s and
//! [`CommandResponse`](courier_core::CommandResponse)s over TCP: transports
//! carry raw chunks, the [`frame`] module reassembles them, and a
//! [`WireCodec`] turns payloads into values through a JSON codec and a
//! [`Cipher`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_core::CommandMessage;
//! use courier_fabric::{transport::TcpTransport, Connection, WireCodec};
//!
//! # async fn example() -> courier_fabric::Result<()> {
//! let codec = WireCodec::plain();
//! let transport = TcpTransport::connect("127.0.0.1", 9000).await?;
//! let (connection, _reader) = Connection::new(transport);
//!
//! let message = CommandMessage::new(1, "orders", "ping");
//! connection.send(&codec.encode(&message)?).await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod codec;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod events;
pub mod frame;
pub mod transport;

pub use cipher::{Cipher, PlainCipher};
pub use connection::{Connection, ConnectionId, FrameHandler, ReadOptions};
pub use correlation::{CorrelationTable, PendingResponse};
pub use error::{Error, Result};
pub use events::EventBus;
pub use frame::{Desync, DesyncPolicy, FrameDecoder, WireCodec};
