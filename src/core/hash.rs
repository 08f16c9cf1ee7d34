//! Digests and Hash Helpers
//!
//! SHA-256 everywhere. Digests are 32 raw bytes in memory and lowercase hex
//! on the wire and in storage.

use sha2::{Digest as _, Sha256};

/// Hash output type (256 bits / 32 bytes).
pub type Digest = [u8; 32];

/// The all-zero digest used as the genesis back-link.
pub const ZERO_DIGEST: Digest = [0u8; 32];

/// Compute the SHA-256 digest of raw bytes.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 over a prefix byte followed by payload bytes.
///
/// Used for Merkle domain separation between leaves and internal nodes.
pub fn sha256_prefixed(prefix: u8, data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([prefix]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of the empty byte string. Root of an empty Merkle tree.
pub fn empty_digest() -> Digest {
    sha256(b"")
}

/// Lowercase hex form of a digest.
pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parse a digest from its hex form. Fails on wrong length or bad chars.
pub fn from_hex(text: &str) -> Option<Digest> {
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}

/// Count leading zero bits of a digest read as a big-endian integer.
///
/// This is the proof-of-work difficulty measure for block sealing.
pub fn leading_zero_bits(digest: &Digest) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

/// Serde adapter storing a `Digest` as lowercase hex.
pub mod digest_hex {
    use super::Digest;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a digest as a hex string.
    pub fn serialize<S: Serializer>(digest: &Digest, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(digest))
    }

    /// Deserialize a digest from a hex string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

/// Serde adapter storing arbitrary bytes as lowercase hex.
pub mod bytes_hex {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a hex string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize bytes from a hex string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("") is a fixed constant.
        assert_eq!(
            to_hex(&empty_digest()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_prefix_separates_domains() {
        let data = b"payload";
        assert_ne!(sha256_prefixed(0x00, data), sha256_prefixed(0x01, data));
        assert_ne!(sha256_prefixed(0x00, data), sha256(data));
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = sha256(b"roundtrip");
        let text = to_hex(&digest);
        assert_eq!(from_hex(&text), Some(digest));
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(from_hex("zz").is_none());
        assert!(from_hex("ab").is_none()); // too short
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&ZERO_DIGEST), 256);

        let mut digest = ZERO_DIGEST;
        digest[0] = 0b0001_0000;
        assert_eq!(leading_zero_bits(&digest), 3);

        digest[0] = 0xff;
        assert_eq!(leading_zero_bits(&digest), 0);

        digest[0] = 0;
        digest[1] = 1;
        assert_eq!(leading_zero_bits(&digest), 15);
    }
}
