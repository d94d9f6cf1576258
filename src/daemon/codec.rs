//! Text-safe encoding of packet bytes for embedding in a mail body.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::daemon::error::DecodeError;

/// A reversible transform between raw bytes and mail-safe text.
///
/// Implementations carry no state and are shared by both pipelines.
pub trait Codec: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> String;

    fn decode(&self, text: &str) -> Result<Vec<u8>, DecodeError>;
}

/// Standard padded base64 on a single line.
///
/// Decoding ignores CR and LF so that frames re-wrapped by a mail server
/// still decode. Any other character outside the alphabet is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

impl Codec for Base64Codec {
    fn encode(&self, bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    fn decode(&self, text: &str) -> Result<Vec<u8>, DecodeError> {
        if text.contains(['\r', '\n']) {
            let joined: String = text.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
            return Ok(STANDARD.decode(joined)?);
        }
        Ok(STANDARD.decode(text)?)
    }
}
