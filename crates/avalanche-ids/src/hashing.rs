//! Hash functions backing the identifier types.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// One-shot RIPEMD-160, used when deriving node ids from certificate hashes.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // FIPS 180-2 vector for "abc".
        let expected =
            hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .unwrap();
        assert_eq!(sha256(b"abc").as_slice(), expected.as_slice());
    }

    #[test]
    fn ripemd160_matches_known_vector() {
        let expected = hex::decode("8eb208f7e05d987a9b044a8e98c6b087f15a0bfc").unwrap();
        assert_eq!(ripemd160(b"abc").as_slice(), expected.as_slice());
    }

    #[test]
    fn inputs_hash_apart() {
        assert_eq!(sha256(b"snowman"), sha256(b"snowman"));
        assert_ne!(sha256(b"snowman"), sha256(b"avalanche"));
    }
}
