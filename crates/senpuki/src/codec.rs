//! Opaque byte payloads with a tagged codec.
//!
//! A [`Payload`] is a `Vec<u8>` prefixed by a one-byte codec tag so a
//! decoder never has to be told out-of-band which codec produced it —
//! the tag travels with the bytes into storage and back out again.

use crate::error::SenpukiError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Tag byte for [`JsonCodec`].
pub const JSON_TAG: u8 = 0x01;
/// Tag byte for [`BinaryCodec`].
pub const BINARY_TAG: u8 = 0x02;

/// An opaque, tagged byte payload. The first byte is the codec tag; the rest
/// is the encoded value. Cheap to clone for fan-out (child task args, cache
/// writes, notification bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn tag(&self) -> Option<u8> {
        self.0.first().copied()
    }
}

/// Converts a value to/from a tagged [`Payload`]. Implementations must be
/// deterministic about their tag byte so `decode_payload` can dispatch on it
/// without any side channel.
pub trait Codec: Send + Sync {
    fn tag(&self) -> u8;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, SenpukiError>;

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, SenpukiError>;
}

/// Default codec. Human-inspectable, safe for untrusted input: it never
/// executes code and only rejects unknown fields when the caller's type
/// itself derives `#[serde(deny_unknown_fields)]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn tag(&self) -> u8 {
        JSON_TAG
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, SenpukiError> {
        let mut bytes = vec![JSON_TAG];
        serde_json::to_writer(&mut bytes, value)
            .map_err(|e| SenpukiError::SerializationFailed(e.to_string()))?;
        Ok(Payload(bytes))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, SenpukiError> {
        let body = payload
            .0
            .get(1..)
            .ok_or_else(|| SenpukiError::SerializationFailed("empty payload".into()))?;
        serde_json::from_slice(body).map_err(|e| SenpukiError::SerializationFailed(e.to_string()))
    }
}

/// Explicit opt-in codec built on `bincode` v1. Smaller and faster than
/// [`JsonCodec`] but has no schema evolution or self-description: decoding a
/// payload produced by a different version of a type is undefined behavior
/// at the application level (it may succeed and produce garbage rather than
/// erroring). Callers opt in per-[`crate::executor::Executor`] via
/// [`binary`], not per call, so the choice is visible at construction time.
#[cfg(feature = "bincode")]
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

#[cfg(feature = "bincode")]
impl Codec for BinaryCodec {
    fn tag(&self) -> u8 {
        BINARY_TAG
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, SenpukiError> {
        let mut bytes = vec![BINARY_TAG];
        bincode::serialize_into(&mut bytes, value)
            .map_err(|e| SenpukiError::SerializationFailed(e.to_string()))?;
        Ok(Payload(bytes))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, SenpukiError> {
        let body = payload
            .0
            .get(1..)
            .ok_or_else(|| SenpukiError::SerializationFailed("empty payload".into()))?;
        bincode::deserialize(body).map_err(|e| SenpukiError::SerializationFailed(e.to_string()))
    }
}

/// Returns the default JSON codec.
pub fn json() -> JsonCodec {
    JsonCodec
}

/// Returns the opt-in binary codec. Document at the call site that this is
/// unsafe to use for untrusted or cross-version payloads.
#[cfg(feature = "bincode")]
pub fn binary() -> BinaryCodec {
    BinaryCodec
}

/// Inspects a payload's tag byte and decodes using whichever codec produced
/// it. An unknown tag is a [`SenpukiError::SerializationFailed`], never a
/// panic.
pub fn decode_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, SenpukiError> {
    match payload.tag() {
        Some(JSON_TAG) => JsonCodec.decode(payload),
        #[cfg(feature = "bincode")]
        Some(BINARY_TAG) => BinaryCodec.decode(payload),
        Some(other) => Err(SenpukiError::SerializationFailed(format!(
            "unknown codec tag {other:#04x}"
        ))),
        None => Err(SenpukiError::SerializationFailed("empty payload".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    #[test]
    fn json_round_trips() {
        let p = Point { x: 1, y: -2 };
        let payload = json().encode(&p).unwrap();
        assert_eq!(payload.tag(), Some(JSON_TAG));
        let back: Point = decode_payload(&payload).unwrap();
        assert_eq!(p, back);
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn binary_round_trips() {
        let p = Point { x: 10, y: 20 };
        let payload = binary().encode(&p).unwrap();
        assert_eq!(payload.tag(), Some(BINARY_TAG));
        let back: Point = decode_payload(&payload).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn unknown_tag_is_serialization_error() {
        let payload = Payload(vec![0xEE, 1, 2, 3]);
        let result: Result<Point, _> = decode_payload(&payload);
        assert!(matches!(result, Err(SenpukiError::SerializationFailed(_))));
    }
}
