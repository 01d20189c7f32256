//! CB58 string encoding.
//!
//! CB58 is Base58 with a 4-byte SHA-256 checksum suffix. It is the string
//! form of every identifier in this workspace: the checksum catches typos
//! and truncation that plain Base58 would silently accept.

use thiserror::Error;

use crate::hashing::sha256;

const CHECKSUM_LEN: usize = 4;

/// Why a CB58 string failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Cb58Error {
    /// The string contains characters outside the Base58 alphabet.
    #[error("not a base58 string")]
    NotBase58,

    /// The decoded bytes are shorter than the checksum suffix.
    #[error("decoded to {len} bytes, shorter than the {CHECKSUM_LEN}-byte checksum")]
    TooShort { len: usize },

    /// The checksum suffix does not match the payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// The last 4 bytes of the payload's SHA-256 hash.
fn checksum_tail(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = sha256(payload);
    let mut tail = [0u8; CHECKSUM_LEN];
    tail.copy_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
    tail
}

/// Encodes `payload` as a CB58 string.
///
/// # Examples
///
/// ```
/// use avalanche_ids::{decode_cb58, encode_cb58};
///
/// let s = encode_cb58(&[7, 7, 7]);
/// assert_eq!(decode_cb58(&s).unwrap(), vec![7, 7, 7]);
/// ```
pub fn encode_cb58(payload: &[u8]) -> String {
    let mut checked = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    checked.extend_from_slice(payload);
    checked.extend_from_slice(&checksum_tail(payload));
    bs58::encode(checked).into_string()
}

/// Decodes a CB58 string, verifying and stripping its checksum suffix.
pub fn decode_cb58(encoded: &str) -> Result<Vec<u8>, Cb58Error> {
    let mut decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| Cb58Error::NotBase58)?;

    if decoded.len() < CHECKSUM_LEN {
        return Err(Cb58Error::TooShort { len: decoded.len() });
    }

    let payload_len = decoded.len() - CHECKSUM_LEN;
    if decoded[payload_len..] != checksum_tail(&decoded[..payload_len]) {
        return Err(Cb58Error::ChecksumMismatch);
    }

    decoded.truncate(payload_len);
    Ok(decoded)
}
