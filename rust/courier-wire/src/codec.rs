//! Pluggable payload serialization.
//!
//! The core never interprets payload bytes: envelopes carry opaque blobs and
//! the codec is the only place where user types meet the wire. Implement
//! [`PayloadCodec`] to bring your own format; [`JsonCodec`] is the default.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Payload;

/// Error reported by a codec to the core.
#[derive(Debug)]
pub enum TranslationError {
    /// No payload to decode from.
    NoSource,
    /// The payload bytes are malformed for the codec's format.
    SourceCorrupted(Box<dyn std::error::Error + Send + Sync>),
    /// The payload is well-formed but does not describe the requested type.
    DestSrcMismatch(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslationError::NoSource => write!(f, "no payload to decode"),
            TranslationError::SourceCorrupted(e) => write!(f, "payload corrupted: {e}"),
            TranslationError::DestSrcMismatch(e) => {
                write!(f, "payload does not match destination type: {e}")
            }
        }
    }
}

impl std::error::Error for TranslationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TranslationError::NoSource => None,
            TranslationError::SourceCorrupted(e) | TranslationError::DestSrcMismatch(e) => {
                Some(e.as_ref())
            }
        }
    }
}

/// Payload serialization seam consumed by the core.
///
/// `Clone + Send + Sync` so one codec instance can be shared by requesters,
/// providers, and routers alike.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Encode a value into an opaque payload.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, TranslationError>;

    /// Decode a payload into a value. `None` and empty payloads report
    /// [`TranslationError::NoSource`].
    fn decode<T: DeserializeOwned>(&self, payload: Option<&Payload>)
        -> Result<T, TranslationError>;
}

/// JSON codec backed by `serde_json`.
///
/// Human-readable and schema-free, which suits a framework whose payloads
/// are opaque to everything but the two endpoints. Swap in a binary codec
/// via [`PayloadCodec`] when wire size matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, TranslationError> {
        serde_json::to_vec(value).map_err(classify)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        payload: Option<&Payload>,
    ) -> Result<T, TranslationError> {
        let bytes = match payload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(TranslationError::NoSource),
        };
        serde_json::from_slice(bytes).map_err(classify)
    }
}

fn classify(err: serde_json::Error) -> TranslationError {
    // Syntax and premature-end errors mean the bytes themselves are bad;
    // data errors mean valid JSON of the wrong shape.
    match err.classify() {
        serde_json::error::Category::Data => TranslationError::DestSrcMismatch(Box::new(err)),
        _ => TranslationError::SourceCorrupted(Box::new(err)),
    }
}
