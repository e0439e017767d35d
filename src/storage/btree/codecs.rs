//! Key and value encodings stored inside buckets.

use std::cmp::Ordering;

use crate::primitives::bytes::ord;
use crate::types::{Result, RidbagError};

/// Trait implemented by key types that can be encoded for storage in the tree.
pub trait KeyCodec: Sized {
    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering;

    /// Decode a key from exactly its encoded bytes.
    fn decode_key(bytes: &[u8]) -> Result<Self>;

    /// Length of the encoded key occupying the prefix of `bytes`.
    fn encoded_len(bytes: &[u8]) -> Result<usize>;
}

/// Trait implemented by value types that can be stored in tree leaves.
pub trait ValCodec: Sized {
    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from exactly its encoded bytes.
    fn decode_val(src: &[u8]) -> Result<Self>;

    /// Length of the encoded value occupying the prefix of `bytes`.
    fn encoded_len(bytes: &[u8]) -> Result<usize>;
}

/// Key of one edge inside a rid-bag: the owning bag and the target record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct EdgeKey {
    /// Rid-bag the edge belongs to.
    pub rid_bag_id: i64,
    /// Cluster of the edge target.
    pub target_cluster: i32,
    /// Position of the edge target inside its cluster.
    pub target_position: i64,
}

impl EdgeKey {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 20;

    /// Builds a key from its three components.
    pub const fn new(rid_bag_id: i64, target_cluster: i32, target_position: i64) -> Self {
        Self {
            rid_bag_id,
            target_cluster,
            target_position,
        }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.rid_bag_id, self.target_cluster, self.target_position
        )
    }
}

impl std::str::FromStr for EdgeKey {
    type Err = RidbagError;

    /// Parses `bag:cluster:position`.
    fn from_str(text: &str) -> Result<Self> {
        let invalid = || {
            RidbagError::InvalidOwned(format!("edge key '{text}' is not bag:cluster:position"))
        };
        let mut parts = text.trim().split(':');
        let (Some(bag), Some(cluster), Some(position), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(Self::new(
            bag.parse().map_err(|_| invalid())?,
            cluster.parse().map_err(|_| invalid())?,
            position.parse().map_err(|_| invalid())?,
        ))
    }
}

fn fixed_len(bytes: &[u8], len: usize, what: &'static str) -> Result<usize> {
    if bytes.len() < len {
        return Err(RidbagError::Corruption(what));
    }
    Ok(len)
}

impl KeyCodec for EdgeKey {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        let mut buf = [0u8; Self::ENCODED_LEN];
        ord::put_i64_be(&mut buf[0..8], key.rid_bag_id);
        ord::put_i32_be(&mut buf[8..12], key.target_cluster);
        ord::put_i64_be(&mut buf[12..20], key.target_position);
        out.extend_from_slice(&buf);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(RidbagError::Corruption("EdgeKey length mismatch"));
        }
        Ok(Self {
            rid_bag_id: ord::get_i64_be(&bytes[0..8]),
            target_cluster: ord::get_i32_be(&bytes[8..12]),
            target_position: ord::get_i64_be(&bytes[12..20]),
        })
    }

    fn encoded_len(bytes: &[u8]) -> Result<usize> {
        fixed_len(bytes, Self::ENCODED_LEN, "EdgeKey truncated")
    }
}

impl KeyCodec for u64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(RidbagError::Corruption("u64 key length mismatch"));
        }
        Ok(ord::get_u64_be(bytes))
    }

    fn encoded_len(bytes: &[u8]) -> Result<usize> {
        fixed_len(bytes, 8, "u64 key truncated")
    }
}

impl ValCodec for i32 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = src
            .try_into()
            .map_err(|_| RidbagError::Corruption("i32 value length mismatch"))?;
        Ok(i32::from_be_bytes(bytes))
    }

    fn encoded_len(bytes: &[u8]) -> Result<usize> {
        fixed_len(bytes, 4, "i32 value truncated")
    }
}

impl ValCodec for u64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.len() != 8 {
            return Err(RidbagError::Corruption("u64 value length mismatch"));
        }
        Ok(ord::get_u64_be(src))
    }

    fn encoded_len(bytes: &[u8]) -> Result<usize> {
        fixed_len(bytes, 8, "u64 value truncated")
    }
}

/// Variable-length values carry a u16 length prefix.
impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&value[..usize::from(len)]);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        let len = Self::encoded_len(src)?;
        if len != src.len() {
            return Err(RidbagError::Corruption("byte value length mismatch"));
        }
        Ok(src[2..].to_vec())
    }

    fn encoded_len(bytes: &[u8]) -> Result<usize> {
        if bytes.len() < 2 {
            return Err(RidbagError::Corruption("byte value truncated"));
        }
        let len = 2 + usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        fixed_len(bytes, len, "byte value truncated")
    }
}
