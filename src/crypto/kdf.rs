/**
 * crypto/kdf.rs
 *
 * BLAKE3 key derivation with fixed domain separation contexts
 */

use super::types::{SharedSecret, SHARED_SECRET_LEN};

/// Context for secrets derived from X25519 agreements
pub const CLASSIC_KEM_CONTEXT: &str = "SkyBridge P2P v1 classic kem";

/// Context for secrets derived from ML-KEM-768 shared keys
pub const PQC_KEM_CONTEXT: &str = "SkyBridge P2P v1 mlkem768 kem";

/// Context for the combined X25519 + ML-KEM-768 secret
pub const HYBRID_KEM_CONTEXT: &str = "SkyBridge P2P v1 hybrid kem";

/// Context for AEAD session keys derived from a KEM secret
pub const SESSION_AEAD_CONTEXT: &str = "SkyBridge P2P v1 session aead";

/// Derive a 32-byte secret from `parts` under `context`.
///
/// Each part is length-prefixed so that moving bytes between adjacent
/// parts changes the output.
pub fn derive_secret(context: &str, parts: &[&[u8]]) -> SharedSecret {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; SHARED_SECRET_LEN];
    out.copy_from_slice(hasher.finalize().as_bytes());
    SharedSecret::from(out)
}

/// Short printable fingerprint for logs (first 8 bytes of the BLAKE3 hash)
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&blake3::hash(bytes).as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_separate_outputs() {
        let ikm: &[u8] = b"same input keying material";
        let a = derive_secret(CLASSIC_KEM_CONTEXT, &[ikm]);
        let b = derive_secret(PQC_KEM_CONTEXT, &[ikm]);
        assert_ne!(a, b);
    }

    #[test]
    fn part_boundaries_matter() {
        let a = derive_secret(CLASSIC_KEM_CONTEXT, &[b"ab", b"c"]);
        let b = derive_secret(CLASSIC_KEM_CONTEXT, &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_secret(HYBRID_KEM_CONTEXT, &[b"x", b"y"]);
        let b = derive_secret(HYBRID_KEM_CONTEXT, &[b"x", b"y"]);
        assert_eq!(a, b);
        assert_eq!(fingerprint(b"key").len(), 16);
    }
}
