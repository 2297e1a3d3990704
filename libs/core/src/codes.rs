//! Response codes produced by the messaging layer itself.
//!
//! Business logic is free to use any other positive code for its own error
//! classes; these are reserved for responses synthesized by the client.

/// The command was handled, or a fire-and-forget send was written.
pub const SUCCESS: i32 = 0;

/// The persistent connection is not established.
pub const CONNECTION_INACTIVE: i32 = 900101;

/// Encoding, connecting or writing the command failed.
pub const SEND_FAILED: i32 = 900102;

/// No response arrived within the caller's wait. The outcome is unknown.
pub const TIMED_OUT: i32 = 900109;

/// Returns true for codes the client synthesizes when the command never
/// reached the wire.
pub fn is_undelivered(code: i32) -> bool {
    matches!(code, CONNECTION_INACTIVE | SEND_FAILED)
}
