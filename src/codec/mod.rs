//! Codec module - serialization of frame headers and bodies.
//!
//! Two codecs are available, selected per connection by the handshake:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (reference codec, default)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker structs with static methods. [`CodecType`] is the
//! negotiated identifier; it dispatches to the matching codec, so the rest of
//! the crate only ever holds a `CodecType`.
//!
//! # Example
//!
//! ```
//! use trpc::codec::CodecType;
//!
//! let codec: CodecType = "application/json".parse().unwrap();
//! let encoded = codec.encode(&(2, 3)).unwrap();
//! let decoded: (i32, i32) = codec.decode(&encoded).unwrap();
//! assert_eq!(decoded, (2, 3));
//! ```

mod json;
mod msgpack;

use std::fmt;
use std::str::FromStr;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::{Result, RpcError};

/// Identifier of a wire codec, as carried in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecType {
    /// `application/msgpack`
    #[default]
    MsgPack,
    /// `application/json`
    Json,
}

impl CodecType {
    /// Handshake identifier of this codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::MsgPack => "application/msgpack",
            CodecType::Json => "application/json",
        }
    }

    /// Encode a value with this codec.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::MsgPack => MsgPackCodec::encode(value),
            CodecType::Json => JsonCodec::encode(value),
        }
    }

    /// Decode a value with this codec.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::MsgPack => MsgPackCodec::decode(bytes),
            CodecType::Json => JsonCodec::decode(bytes),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application/msgpack" => Ok(CodecType::MsgPack),
            "application/json" => Ok(CodecType::Json),
            other => Err(RpcError::UnknownCodec(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_msgpack() {
        assert_eq!(CodecType::default(), CodecType::MsgPack);
    }

    #[test]
    fn test_parse_known_identifiers() {
        for codec in [CodecType::MsgPack, CodecType::Json] {
            assert_eq!(codec.as_str().parse::<CodecType>().unwrap(), codec);
        }
    }

    #[test]
    fn test_parse_unknown_identifier() {
        let err = "application/gob".parse::<CodecType>().unwrap_err();
        assert!(matches!(err, RpcError::UnknownCodec(ref s) if s == "application/gob"));
    }

    #[test]
    fn test_codecs_disagree_on_bytes() {
        let msgpack = CodecType::MsgPack.encode(&5u32).unwrap();
        let json = CodecType::Json.encode(&5u32).unwrap();
        assert_eq!(msgpack, vec![0x05]);
        assert_eq!(json, b"5");
    }
}
