//! Binary-safe encoding for credential material.
//!
//! The remote key-value store only carries text, but credential records are
//! full of raw key material. `Binary` serializes as a `{"$binary": <base64>}`
//! tag object, distinct from every ordinary JSON value, so decoding
//! reconstructs the exact original buffers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tag key marking a base64-encoded binary payload.
const BINARY_TAG: &str = "$binary";

/// A raw binary payload that round-trips exactly through JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary(pub Vec<u8>);

impl Binary {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(BINARY_TAG, &BASE64.encode(&self.0))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "$binary")]
            payload: String,
        }

        let tagged = Tagged::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(tagged.payload.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 in binary tag: {e}")))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_binary_serializes_as_tag_object() {
        let bin = Binary(vec![0x00, 0x01, 0xff]);
        let json = serde_json::to_value(&bin).unwrap();
        assert_eq!(json, serde_json::json!({ "$binary": "AAH/" }));
    }

    #[test]
    fn test_binary_round_trip_is_byte_identical() {
        // Includes bytes that are invalid UTF-8 and would corrupt through
        // any string-based carrier.
        let original = Binary(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x80, 0xfe]);
        let text = serde_json::to_string(&original).unwrap();
        let decoded: Binary = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_binary_round_trip() {
        let original = Binary(Vec::new());
        let text = serde_json::to_string(&original).unwrap();
        let decoded: Binary = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result: Result<Binary, _> =
            serde_json::from_str(r#"{"$binary": "not base64!!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_plain_string_is_not_binary() {
        let result: Result<Binary, _> = serde_json::from_str(r#""AAH/""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_untagged_object_is_not_binary() {
        let result: Result<Binary, _> = serde_json::from_str(r#"{"data": "AAH/"}"#);
        assert!(result.is_err());
    }
}
