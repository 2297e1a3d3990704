use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// JSON codec, the only plaintext format the wire protocol defines
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        serde_json::from_str(text).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{CommandMessage, ExecutionType};

    #[test]
    fn decode_rejects_malformed_text() {
        let result: Result<CommandMessage> = JsonCodec.decode("{not json");
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn command_survives_the_codec() {
        let message = CommandMessage::new(12, "inventory", "reserve")
            .with_execution_type(ExecutionType::Persistent)
            .with_argument("sku", "A-1");

        let text = JsonCodec.encode(&message).unwrap();
        let decoded: CommandMessage = JsonCodec.decode(&text).unwrap();
        assert_eq!(decoded, message);
    }
}
