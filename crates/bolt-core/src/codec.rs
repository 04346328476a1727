//! Payload codecs.
//!
//! A payload codec turns application values into the opaque byte strings
//! carried in envelope payloads. The enum allows the wire flags to name the
//! encoding and keeps the API object-safe-free: the generic `encode`/`decode`
//! methods monomorphize at the registration and call sites, where the
//! concrete argument and reply shapes are known.
//!
//! Two codecs are provided: JSON (`serde_json`) for a self-describing text
//! object notation, and `postcard` for a compact schema-driven binary
//! format. The pairing of payload codec and wire layout is a deployment
//! choice; both sides of a connection must agree.
//!
//! # Example
//!
//! ```
//! use bolt_core::codec::PayloadCodec;
//!
//! let codec = PayloadCodec::Json;
//! let bytes = codec.encode(&vec![1u32, 2, 3]).unwrap();
//! let back: Vec<u32> = codec.decode(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Code, Error, Result};

/// A payload encoding for application values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCodec {
    /// Self-describing JSON text.
    #[default]
    Json,
    /// Compact schema-driven binary (`postcard`).
    Postcard,
}

impl PayloadCodec {
    /// The codec's name, as used in logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            PayloadCodec::Json => "json",
            PayloadCodec::Postcard => "postcard",
        }
    }

    /// The encoding id carried in the low nibble of the frame flags byte.
    ///
    /// Id 0 is reserved for raw/unspecified payloads.
    pub fn wire_id(&self) -> u8 {
        match self {
            PayloadCodec::Json => 1,
            PayloadCodec::Postcard => 2,
        }
    }

    /// Looks a codec up by wire id. The id is advisory, so an unknown id is
    /// simply `None` rather than an error.
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(PayloadCodec::Json),
            2 => Some(PayloadCodec::Postcard),
            _ => None,
        }
    }

    /// Encodes a value to bytes.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Json => serde_json::to_vec(value)
                .map_err(|e| Error::wrap(Code::Unknown, e, "encode json payload")),
            PayloadCodec::Postcard => postcard::to_allocvec(value)
                .map_err(|e| Error::wrap(Code::Unknown, e, "encode postcard payload")),
        }
    }

    /// Decodes bytes into a fresh value.
    ///
    /// Decode failures are `invalid_argument`: the bytes did not match the
    /// declared shape.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json => serde_json::from_slice(data)
                .map_err(|e| Error::wrap(Code::InvalidArgument, e, "decode json payload")),
            PayloadCodec::Postcard => postcard::from_bytes(data)
                .map_err(|e| Error::wrap(Code::InvalidArgument, e, "decode postcard payload")),
        }
    }

    /// Decodes bytes through a caller-supplied destination.
    ///
    /// This lets a caller allocate the concrete value ahead of time and have
    /// the codec write into it, which is the shape the dispatch engine needs.
    pub fn decode_into<T: DeserializeOwned>(&self, data: &[u8], dest: &mut T) -> Result<()> {
        *dest = self.decode(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
        tags: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            name: "thing".to_string(),
            count: 42,
            tags: vec!["a".to_string(), "b".to_string()],
        }
    }

    #[test]
    fn test_json_round_trip() {
        let codec = PayloadCodec::Json;
        let bytes = codec.encode(&sample()).unwrap();
        let back: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_postcard_round_trip() {
        let codec = PayloadCodec::Postcard;
        let bytes = codec.encode(&sample()).unwrap();
        let back: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_decode_into_overwrites_destination() {
        let codec = PayloadCodec::Json;
        let bytes = codec.encode(&sample()).unwrap();
        let mut dest = Sample::default();
        codec.decode_into(&bytes, &mut dest).unwrap();
        assert_eq!(dest, sample());
    }

    #[test]
    fn test_decode_failure_is_invalid_argument() {
        let codec = PayloadCodec::Json;
        let err = codec.decode::<Sample>(b"not json").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_metadata_maps_round_trip_in_both_codecs() {
        let mut metadata = HashMap::new();
        metadata.insert("trace_id".to_string(), "abc123".to_string());
        metadata.insert("tenant".to_string(), "acme".to_string());

        for codec in [PayloadCodec::Json, PayloadCodec::Postcard] {
            let bytes = codec.encode(&metadata).unwrap();
            let back: HashMap<String, String> = codec.decode(&bytes).unwrap();
            assert_eq!(back, metadata, "codec {}", codec.name());
        }
    }

    #[test]
    fn test_wire_ids() {
        assert_eq!(PayloadCodec::Json.wire_id(), 1);
        assert_eq!(PayloadCodec::Postcard.wire_id(), 2);
        assert_eq!(PayloadCodec::from_wire_id(1), Some(PayloadCodec::Json));
        assert_eq!(PayloadCodec::from_wire_id(0), None);
        assert_eq!(PayloadCodec::from_wire_id(9), None);
    }
}
