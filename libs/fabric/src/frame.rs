//! Frame layout and incremental reassembly
//!
//! Every frame is a 12-byte header followed by the payload:
//!
//! ```text
//! [i32 le = i32::MIN] [i32 le payload length] [i32 le = i32::MAX] [payload]
//! ```
//!
//! The two sentinels are the only integrity check. When either does not match,
//! the decoder drops everything it has buffered; it never scans forward for
//! the next valid header.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cipher::{Cipher, PlainCipher};
use crate::codec::{Codec, JsonCodec};
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;
pub const SENTINEL_LOW: i32 = i32::MIN;
pub const SENTINEL_HIGH: i32 = i32::MAX;

/// Largest payload accepted by default (100MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub low: i32,
    pub payload_len: i32,
    pub high: i32,
}

impl FrameHeader {
    /// Header for a payload of `len` bytes
    pub fn for_payload(len: usize) -> Result<Self> {
        let payload_len = i32::try_from(len)
            .map_err(|_| Error::InvalidFrame(format!("Payload too large: {} bytes", len)))?;
        Ok(Self {
            low: SENTINEL_LOW,
            payload_len,
            high: SENTINEL_HIGH,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.low.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.high.to_le_bytes());
        bytes
    }

    /// Read a header from the first 12 bytes of `bytes`
    ///
    /// Callers must pass at least [`HEADER_LEN`] bytes.
    pub fn read(bytes: &[u8]) -> Self {
        Self {
            low: read_i32(bytes, 0),
            payload_len: read_i32(bytes, 4),
            high: read_i32(bytes, 8),
        }
    }

    pub fn has_valid_sentinels(&self) -> bool {
        self.low == SENTINEL_LOW && self.high == SENTINEL_HIGH
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(word)
}

/// Details of a header that failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "bad header [{low}, {payload_len}, {high}] at offset {offset}, discarded {discarded} buffered bytes"
)]
pub struct Desync {
    pub offset: usize,
    pub low: i32,
    pub payload_len: i32,
    pub high: i32,
    pub discarded: usize,
}

/// What a connection does after its decoder reports a [`Desync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncPolicy {
    /// Drop the buffered bytes and keep reading from the same connection
    #[default]
    Discard,
    /// Drop the buffered bytes and close the connection
    Close,
}

/// Frames completed by one call to [`FrameDecoder::feed`]
#[derive(Debug, Default)]
pub struct Arrival {
    /// Payloads in wire order
    pub frames: Vec<Vec<u8>>,
    /// Set when decoding stopped on a bad header
    pub desync: Option<Desync>,
}

/// Per-connection reassembly buffer
///
/// Bytes arrive in arbitrary chunks; [`feed`](Self::feed) returns every
/// frame the chunk completes and keeps the unconsumed tail for the next call.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Arrival {
        self.buffer.extend_from_slice(chunk);

        let mut arrival = Arrival::default();
        let mut offset = 0;

        loop {
            let remaining = self.buffer.len() - offset;
            if remaining < HEADER_LEN {
                break;
            }

            let header = FrameHeader::read(&self.buffer[offset..offset + HEADER_LEN]);
            let payload_len = usize::try_from(header.payload_len).ok();

            let payload_len = match payload_len {
                Some(len) if header.has_valid_sentinels() && len <= self.max_frame_len => len,
                _ => {
                    arrival.desync = Some(Desync {
                        offset,
                        low: header.low,
                        payload_len: header.payload_len,
                        high: header.high,
                        discarded: self.buffer.len(),
                    });
                    self.buffer.clear();
                    return arrival;
                }
            };

            if remaining - HEADER_LEN < payload_len {
                break;
            }

            let start = offset + HEADER_LEN;
            arrival
                .frames
                .push(self.buffer[start..start + payload_len].to_vec());
            offset = start + payload_len;
        }

        self.buffer.drain(..offset);
        arrival
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializer, cipher and framing combined
///
/// Encoding is `codec -> encrypt -> UTF-8 -> header + payload`; decoding a
/// payload reverses the first three steps.
#[derive(Clone)]
pub struct WireCodec<C = JsonCodec> {
    codec: C,
    cipher: Arc<dyn Cipher>,
}

impl WireCodec<JsonCodec> {
    /// JSON codec with the given cipher
    pub fn json(cipher: Arc<dyn Cipher>) -> Self {
        Self::new(JsonCodec, cipher)
    }

    /// JSON codec without encryption
    pub fn plain() -> Self {
        Self::json(Arc::new(PlainCipher))
    }
}

impl<C: Codec> WireCodec<C> {
    pub fn new(codec: C, cipher: Arc<dyn Cipher>) -> Self {
        Self { codec, cipher }
    }

    /// Encode a value into one complete frame
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let text = self.codec.encode(value)?;
        let payload = self.cipher.encrypt(&text)?.into_bytes();
        let header = FrameHeader::for_payload(payload.len())?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode the payload of one frame
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        let ciphertext = std::str::from_utf8(payload)
            .map_err(|e| Error::InvalidFrame(format!("Payload is not UTF-8: {}", e)))?;
        let text = self.cipher.decrypt(ciphertext)?;
        self.codec.decode(&text)
    }
}
