//! 32-byte identifier type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::cb58::{decode_cb58, encode_cb58, Cb58Error};
use crate::hashing::sha256;
use crate::ID_LEN;

/// A 32-byte identifier.
///
/// Blocks, chains, and subnets are all named by `Id`s, usually the SHA-256
/// hash of their serialized contents. The human-readable form is CB58.
///
/// # Examples
///
/// ```
/// use avalanche_ids::Id;
///
/// let id = Id::from_hash(b"genesis");
/// let parsed: Id = id.to_string().parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; ID_LEN]);

/// Why an id string failed to parse.
#[derive(Debug, Error)]
pub enum ParseIdError {
    /// The string is not valid CB58.
    #[error(transparent)]
    Cb58(#[from] Cb58Error),

    /// The payload has the wrong length for an id.
    #[error("an id is {ID_LEN} bytes, the payload has {0}")]
    WrongLength(usize),
}

impl Id {
    /// The all-zero id.
    pub const EMPTY: Self = Self([0; ID_LEN]);

    /// Wraps raw bytes as an id.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Converts a slice into an id, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseIdError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| ParseIdError::WrongLength(bytes.len()))
    }

    /// The id of a byte string: its SHA-256 hash.
    #[must_use]
    pub fn from_hash(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }

    /// The raw bytes of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Whether this is the all-zero id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_cb58(&self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(&decode_cb58(s)?)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
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
