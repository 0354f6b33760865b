//! MsgPack codec using `rmp-serde`, the reference codec.
//!
//! Structs are written with `to_vec_named` (struct-as-map), so a peer
//! decodes fields by name and a header can gain a field without breaking
//! older readers.
//!
//! # Example
//!
//! ```
//! use trpc::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! let args = Args { num1: 2, num2: 3 };
//! let encoded = MsgPackCodec::encode(&args).unwrap();
//! let decoded: Args = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, args);
//! ```

use crate::error::Result;

/// MessagePack codec; structs become maps keyed by field name.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MsgPackDecode`](crate::RpcError::MsgPackDecode)
    /// if the bytes do not describe a `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::protocol::Header;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    #[test]
    fn test_header_is_named_map() {
        let header = Header::request("Foo.Sum", 7);
        let encoded = MsgPackCodec::encode(&header).unwrap();

        // fixmap with 3 entries, first key "service_method"
        assert_eq!(encoded[0], 0x83);
        assert_eq!(encoded[1], 0xa0 | "service_method".len() as u8);
        assert_eq!(&encoded[2..16], b"service_method");

        let decoded: Header = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_without_error_field() {
        #[derive(Serialize)]
        struct OldHeader {
            service_method: String,
            seq: u64,
        }

        let encoded = MsgPackCodec::encode(&OldHeader {
            service_method: "Foo.Sum".to_string(),
            seq: 3,
        })
        .unwrap();

        let decoded: Header = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.seq, 3);
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_fields_decoded_by_name() {
        #[derive(Serialize)]
        struct Reordered {
            num2: i64,
            extra: bool,
            num1: i64,
        }

        let encoded = MsgPackCodec::encode(&Reordered {
            num2: 3,
            extra: true,
            num1: 2,
        })
        .unwrap();

        let decoded: Args = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, Args { num1: 2, num2: 3 });
    }

    #[test]
    fn test_map_reply() {
        let mut counts = BTreeMap::new();
        counts.insert("a".to_string(), 2u32);
        counts.insert("b".to_string(), 1u32);

        let encoded = MsgPackCodec::encode(&counts).unwrap();
        let decoded: BTreeMap<String, u32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, counts);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let encoded = MsgPackCodec::encode(&"not args").unwrap();
        let result: Result<Args> = MsgPackCodec::decode(&encoded);
        assert!(matches!(result, Err(RpcError::MsgPackDecode(_))));
    }

    #[test]
    fn test_unit_encodes_as_nil() {
        // Error responses carry `()` as their body.
        let encoded = MsgPackCodec::encode(&()).unwrap();
        assert_eq!(encoded, vec![0xc0]);
    }

    #[test]
    fn test_binary_argument_is_bin8() {
        let data = vec![0x01u8, 0x02, 0x03];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();
        assert_eq!(encoded[..2], [0xc4, 3]);

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data[..]);
    }
}
