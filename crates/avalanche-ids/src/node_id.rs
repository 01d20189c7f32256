//! Validator node identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::cb58::{decode_cb58, encode_cb58, Cb58Error};
use crate::hashing::{ripemd160, sha256};
use crate::NODE_ID_LEN;

/// Prefix of a node id's string form.
pub const NODE_ID_PREFIX: &str = "NodeID-";

/// A 20-byte validator identifier.
///
/// Node ids are bound to a node's TLS certificate:
/// `ripemd160(sha256(certificate_der))`. The string form is CB58 behind a
/// `NodeID-` prefix.
///
/// # Examples
///
/// ```
/// use avalanche_ids::NodeId;
///
/// let node = NodeId::from_cert(b"certificate bytes");
/// let s = node.to_string();
/// assert!(s.starts_with("NodeID-"));
/// assert_eq!(s.parse::<NodeId>().unwrap(), node);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// Why a node-id string failed to parse.
#[derive(Debug, Error)]
pub enum ParseNodeIdError {
    /// The `NodeID-` prefix is missing.
    #[error("node ids start with {NODE_ID_PREFIX:?}")]
    MissingPrefix,

    /// The remainder is not valid CB58.
    #[error(transparent)]
    Cb58(#[from] Cb58Error),

    /// The payload has the wrong length for a node id.
    #[error("a node id is {NODE_ID_LEN} bytes, the payload has {0}")]
    WrongLength(usize),
}

impl NodeId {
    /// The all-zero node id.
    pub const EMPTY: Self = Self([0; NODE_ID_LEN]);

    /// Wraps raw bytes as a node id.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Converts a slice into a node id, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseNodeIdError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| ParseNodeIdError::WrongLength(bytes.len()))
    }

    /// Derives the node id of a DER-encoded TLS certificate.
    #[must_use]
    pub fn from_cert(cert_der: &[u8]) -> Self {
        Self(ripemd160(&sha256(cert_der)))
    }

    /// The raw bytes of this node id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Whether this is the all-zero node id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_ID_PREFIX}{}", encode_cb58(&self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(NODE_ID_PREFIX)
            .ok_or(ParseNodeIdError::MissingPrefix)?;
        Self::from_slice(&decode_cb58(encoded)?)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            String::deserialize(deserializer)?
                .parse()
                .map_err(D::Error::custom)
        } else {
            Self::from_slice(&Vec::<u8>::deserialize(deserializer)?).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_all_zeroes() {
        assert!(NodeId::EMPTY.is_empty());
        assert!(!NodeId::from_bytes([1; NODE_ID_LEN]).is_empty());
    }

    #[test]
    fn slice_conversion_checks_length() {
        let node = NodeId::from_slice(&[7; NODE_ID_LEN]).unwrap();
        assert_eq!(node.as_bytes(), &[7; NODE_ID_LEN]);

        assert!(matches!(
            NodeId::from_slice(&[7; 3]),
            Err(ParseNodeIdError::WrongLength(3))
        ));
    }

    #[test]
    fn cert_derivation_is_stable() {
        let a = NodeId::from_cert(b"certificate a");
        assert_eq!(a, NodeId::from_cert(b"certificate a"));
        assert_ne!(a, NodeId::from_cert(b"certificate b"));
        assert!(!a.is_empty());
    }

    #[test]
    fn display_round_trips_with_prefix() {
        let node = NodeId::from_cert(b"round trip");
        let s = node.to_string();
        assert!(s.starts_with(NODE_ID_PREFIX));
        assert_eq!(s.parse::<NodeId>().unwrap(), node);
    }

    #[test]
    fn parse_requires_the_prefix() {
        let bare = encode_cb58(&[1; NODE_ID_LEN]);
        assert!(matches!(
            bare.parse::<NodeId>(),
            Err(ParseNodeIdError::MissingPrefix)
        ));
    }

    #[test]
    fn parse_rejects_wrong_payload_length() {
        let short = format!("{NODE_ID_PREFIX}{}", encode_cb58(&[1, 2, 3]));
        assert!(matches!(
            short.parse::<NodeId>(),
            Err(ParseNodeIdError::WrongLength(3))
        ));
    }

    #[test]
    fn node_ids_order_bytewise() {
        assert!(NodeId::from_bytes([0; NODE_ID_LEN]) < NodeId::from_bytes([1; NODE_ID_LEN]));
    }

    #[test]
    fn json_round_trips_with_prefix() {
        let node = NodeId::from_cert(b"json");
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains(NODE_ID_PREFIX));
        assert_eq!(serde_json::from_str::<NodeId>(&json).unwrap(), node);
    }
}
