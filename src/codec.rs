//! Payload encoding
//!
//! Published messages carry their payload kind in [`CONTENT_TYPE_HEADER`].
//! Untagged input is sniffed JSON first: anything that parses as JSON decodes
//! to [`Payload::Json`], valid UTF-8 that does not parse falls back to
//! [`Payload::Text`], and anything else stays raw bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Header recording the payload kind of a published message
pub const CONTENT_TYPE_HEADER: &str = "content-type";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Message body as seen by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Serialize any value into a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(CodecError::Serialize)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) => JSON_CONTENT_TYPE,
            Payload::Text(_) => TEXT_CONTENT_TYPE,
            Payload::Binary(_) => BINARY_CONTENT_TYPE,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserialize a JSON payload into a typed value
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Payload::Json(value) => {
                serde_json::from_value(value.clone()).map_err(CodecError::Deserialize)
            }
            _ => Err(CodecError::NotJson),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(raw: Vec<u8>) -> Self {
        Payload::Binary(raw)
    }
}

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("Payload is not JSON")]
    NotJson,
}

/// Stateless payload encode/decode
pub trait Codec: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError>;

    /// Sniff an untagged body. Never fails: undecodable input falls back to
    /// text or raw bytes. Text that is itself valid JSON, such as `42` or
    /// `true`, comes back as [`Payload::Json`].
    fn decode(&self, raw: &[u8]) -> Payload;

    /// Decode honoring a [`CONTENT_TYPE_HEADER`] value when one is present
    fn decode_tagged(&self, raw: &[u8], content_type: Option<&str>) -> Payload {
        match content_type.map(str::to_ascii_lowercase).as_deref() {
            Some(kind) if kind.starts_with("text/") => match std::str::from_utf8(raw) {
                Ok(text) => Payload::Text(text.to_string()),
                Err(_) => Payload::Binary(raw.to_vec()),
            },
            Some(BINARY_CONTENT_TYPE) => Payload::Binary(raw.to_vec()),
            _ => self.decode(raw),
        }
    }
}

/// Default JSON-first codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError> {
        match payload {
            Payload::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(CodecError::Serialize),
            Payload::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Payload::Binary(raw) => Ok(Bytes::copy_from_slice(raw)),
        }
    }

    fn decode(&self, raw: &[u8]) -> Payload {
        if let Ok(value) = serde_json::from_slice::<Value>(raw) {
            return Payload::Json(value);
        }
        match std::str::from_utf8(raw) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Binary(raw.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let values = vec![
            json!({"some": "json"}),
            json!([1, 2, 3]),
            json!({"nested": {"flag": true, "n": null}}),
            json!("quoted string"),
            json!(3.5),
        ];

        for value in values {
            let payload = Payload::Json(value);
            let encoded = codec.encode(&payload).unwrap();
            assert_eq!(codec.decode(&encoded), payload);
        }
    }

    #[test]
    fn test_encode_is_compact_json() {
        let encoded = JsonCodec.encode(&json!({"some": "json"}).into()).unwrap();
        assert_eq!(&encoded[..], br#"{"some":"json"}"#);
    }

    #[test]
    fn test_plain_text_falls_back() {
        let codec = JsonCodec;
        let payload = Payload::from("hello device");
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(&encoded[..], b"hello device");
        assert_eq!(codec.decode(&encoded), payload);
    }

    #[test]
    fn test_tagged_text_that_looks_like_json_stays_text() {
        let codec = JsonCodec;
        for text in ["42", "true", "null", r#"{"a":1}"#] {
            let payload = Payload::from(text);
            let encoded = codec.encode(&payload).unwrap();
            assert!(matches!(codec.decode(&encoded), Payload::Json(_)));
            assert_eq!(
                codec.decode_tagged(&encoded, Some(payload.content_type())),
                payload,
                "text {text:?}"
            );
        }
    }

    #[test]
    fn test_tagged_binary_and_json() {
        let codec = JsonCodec;
        let raw = Payload::Binary(b"[1,2]".to_vec());
        let encoded = codec.encode(&raw).unwrap();
        assert_eq!(codec.decode_tagged(&encoded, Some(raw.content_type())), raw);

        let json = Payload::Json(json!({"n": 1}));
        let encoded = codec.encode(&json).unwrap();
        assert_eq!(codec.decode_tagged(&encoded, Some(JSON_CONTENT_TYPE)), json);
        assert_eq!(codec.decode_tagged(&encoded, None), json);
        assert_eq!(
            codec.decode_tagged(b"hello", Some("Text/Plain; charset=utf-8")),
            Payload::from("hello")
        );
    }

    #[test]
    fn test_invalid_utf8_stays_binary() {
        let raw = vec![0xff, 0xfe, 0x00];
        assert_eq!(JsonCodec.decode(&raw), Payload::Binary(raw.clone()));
    }

    #[test]
    fn test_typed_deserialize() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Reading {
            celsius: f64,
        }

        let payload = Payload::json(&json!({"celsius": 21.5})).unwrap();
        let reading: Reading = payload.deserialize().unwrap();
        assert_eq!(reading, Reading { celsius: 21.5 });

        let text = Payload::from("21.5C");
        assert!(matches!(
            text.deserialize::<Reading>(),
            Err(CodecError::NotJson)
        ));
    }
}
