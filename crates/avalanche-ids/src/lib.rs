//! Identifier types for the Avalanche consensus stack.
//!
//! Two identifiers run through the whole engine: [`Id`] names blocks,
//! chains, and subnets by hash, and [`NodeId`] names validators. Both are
//! fixed-size byte arrays with a CB58 string form (Base58 plus a 4-byte
//! checksum).

mod cb58;
mod hashing;
mod id;
mod node_id;

pub use cb58::{decode_cb58, encode_cb58, Cb58Error};
pub use hashing::{ripemd160, sha256};
pub use id::{Id, ParseIdError};
pub use node_id::{NodeId, ParseNodeIdError, NODE_ID_PREFIX};

/// Byte length of an [`Id`].
pub const ID_LEN: usize = 32;

/// Byte length of a [`NodeId`].
pub const NODE_ID_LEN: usize = 20;
