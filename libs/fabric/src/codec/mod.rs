use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub mod json;

pub use self::json::JsonCodec;

/// Codec trait for turning messages into the text that gets encrypted
pub trait Codec: Send + Sync {
    /// Encode a value into text
    fn encode<T: Serialize>(&self, value: &T) -> Result<String>;

    /// Decode text into a value
    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T>;
}
