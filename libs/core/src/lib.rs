//! Courier Core - Message model shared by every courier component
//!
//! Defines the two wire messages ([`CommandMessage`] and [`CommandResponse`]),
//! the well-known response codes and the process-wide unique key sequence.
//!
//! # Example
//!
//! ```
//! use courier_core::{codes, CommandMessage, CommandResponse, ResponseType};
//!
//! let message = CommandMessage::new(7, "billing", "invoice.total")
//!     .with_argument("invoice", "1042");
//!
//! let response = CommandResponse::for_message(&message, codes::SUCCESS, ResponseType::Json, "{}");
//! assert_eq!(response.unique_key, message.unique_key);
//! ```

pub mod codes;
pub mod error;
pub mod message;
pub mod unique_key;

// Re-exports for convenience
pub use error::{Error, Result};
pub use message::{CommandMessage, CommandResponse, ExecutionType, ResponseType};
pub use unique_key::{next_unique_key, KeySequence};
