/**
 * crypto/types.rs
 *
 * Algorithm tags, key material and errors shared by every provider
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of every shared secret handed out by a provider
pub const SHARED_SECRET_LEN: usize = 32;

/// Algorithm family backing a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoAlgorithm {
    /// X25519 key agreement + Ed25519 signatures
    Classic,
    /// X25519 + ML-KEM-768 combined KEM, Ed25519 + ML-DSA-65 signatures
    Hybrid,
    /// ML-KEM-768 + ML-DSA-65
    PostQuantum,
}

impl CryptoAlgorithm {
    /// Stable identifier used on the wire and in presence reports
    pub fn identifier(&self) -> &'static str {
        match self {
            CryptoAlgorithm::Classic => "classic.x25519-ed25519",
            CryptoAlgorithm::Hybrid => "hybrid.x25519-mlkem768.ed25519-mldsa65",
            CryptoAlgorithm::PostQuantum => "pqc.mlkem768-mldsa65",
        }
    }

    pub fn is_post_quantum(&self) -> bool {
        !matches!(self, CryptoAlgorithm::Classic)
    }
}

impl fmt::Display for CryptoAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Provider selection policy, supplied by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    PreferPostQuantum,
    ClassicOnly,
    Hybrid,
}

/// What a generated key pair is going to be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    KeyExchange,
    Signing,
}

/// Opaque key pair. Only the issuing provider knows the encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// 32-byte secret produced by encapsulation / decapsulation
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl From<[u8; SHARED_SECRET_LEN]> for SharedSecret {
    fn from(bytes: [u8; SHARED_SECRET_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Output of `encapsulate`: the local secret and the value the peer decapsulates
#[derive(Debug, Clone)]
pub struct Encapsulation {
    pub shared_secret: SharedSecret,
    pub encapsulated_key: Vec<u8>,
}

/// Crypto provider errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    #[error("encapsulation failed: {0}")]
    EncapsulationFailed(String),

    #[error("decapsulation failed: {0}")]
    DecapsulationFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_flags() {
        assert!(!CryptoAlgorithm::Classic.is_post_quantum());
        assert!(CryptoAlgorithm::Hybrid.is_post_quantum());
        assert!(CryptoAlgorithm::PostQuantum.is_post_quantum());
        assert_ne!(
            CryptoAlgorithm::Hybrid.identifier(),
            CryptoAlgorithm::PostQuantum.identifier()
        );
    }

    #[test]
    fn policy_uses_snake_case_names() {
        let policy: SelectionPolicy = serde_json::from_str("\"classic_only\"").unwrap();
        assert_eq!(policy, SelectionPolicy::ClassicOnly);
        assert_eq!(
            serde_json::to_string(&SelectionPolicy::PreferPostQuantum).unwrap(),
            "\"prefer_post_quantum\""
        );
    }

    #[test]
    fn key_pair_debug_hides_private_key() {
        let pair = KeyPair {
            public_key: vec![0xab],
            private_key: vec![0x42; 4],
        };
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("ab"));
        assert!(!rendered.contains("42424242"));
    }
}
