/**
 * crypto/hybrid.rs
 *
 * Hybrid provider: X25519 + ML-KEM-768 KEM, Ed25519 + ML-DSA-65 signatures
 *
 * Composite values are `len(classic) as u16 BE || classic || post-quantum`.
 */

use tracing::debug;

use super::classic::{
    ed25519_generate, ed25519_sign, ed25519_verify, parse_x25519_public, parse_x25519_secret,
    x25519_agree_ephemeral, x25519_agree_static, x25519_generate,
};
use super::kdf::{self, HYBRID_KEM_CONTEXT};
use super::pqc::{
    mldsa_generate, mldsa_sign, mldsa_verify, mlkem_decapsulate, mlkem_encapsulate,
    mlkem_generate, parse_mlkem_ciphertext, parse_mlkem_private, parse_mlkem_public,
};
use super::types::{
    CryptoAlgorithm, CryptoError, CryptoResult, Encapsulation, KeyPair, KeyPurpose, SharedSecret,
};
use super::{CryptoProvider, KeyEncapsulation, PqcBackend, ProviderKind, SignatureScheme};
use x25519_dalek::PublicKey;

/// Hybrid provider
#[derive(Debug, Clone, Copy)]
pub struct HybridProvider {
    backend: PqcBackend,
}

impl HybridProvider {
    pub fn new(backend: PqcBackend) -> Self {
        Self { backend }
    }
}

impl KeyEncapsulation for HybridProvider {
    fn encapsulate(&self, peer_public_key: &[u8]) -> CryptoResult<Encapsulation> {
        // Both halves are decoded before any agreement runs
        let (classic, post_quantum) = split_composite(peer_public_key, CompositeKind::Key)?;
        let classic_peer = parse_x25519_public(classic)?;
        let pq_peer = parse_mlkem_public(post_quantum)?;

        let (ephemeral_public, classic_raw) = x25519_agree_ephemeral(&classic_peer)?;
        let (ciphertext, pq_raw) = mlkem_encapsulate(&pq_peer)?;

        let shared_secret = kdf::derive_secret(
            HYBRID_KEM_CONTEXT,
            &[
                &classic_raw,
                &pq_raw,
                &ephemeral_public,
                classic_peer.as_bytes(),
                &ciphertext,
            ],
        );
        debug!(
            "Hybrid encapsulation to {} ({:?} backend)",
            kdf::fingerprint(peer_public_key),
            self.backend
        );

        Ok(Encapsulation {
            shared_secret,
            encapsulated_key: join_composite(&ephemeral_public, &ciphertext),
        })
    }

    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &[u8]) -> CryptoResult<SharedSecret> {
        let (classic_enc, pq_enc) = split_composite(encapsulated_key, CompositeKind::Key)?;
        let (classic_priv, pq_priv) = split_composite(private_key, CompositeKind::Key)?;

        let ephemeral = parse_x25519_public(classic_enc)?;
        let ciphertext = parse_mlkem_ciphertext(pq_enc)?;
        let classic_secret = parse_x25519_secret(classic_priv)?;
        let pq_secret = parse_mlkem_private(pq_priv)?;
        let own_public = PublicKey::from(&classic_secret);

        let classic_raw = x25519_agree_static(&classic_secret, &ephemeral)?;
        let pq_raw = mlkem_decapsulate(&pq_secret, &ciphertext)?;

        Ok(kdf::derive_secret(
            HYBRID_KEM_CONTEXT,
            &[
                &classic_raw,
                &pq_raw,
                ephemeral.as_bytes(),
                own_public.as_bytes(),
                pq_enc,
            ],
        ))
    }
}

impl SignatureScheme for HybridProvider {
    fn sign(&self, data: &[u8], private_key: &[u8]) -> CryptoResult<Vec<u8>> {
        let (classic, post_quantum) = split_composite(private_key, CompositeKind::Key)?;
        let classic_sig = ed25519_sign(data, classic)?;
        let pq_sig = mldsa_sign(data, post_quantum)?;
        Ok(join_composite(&classic_sig, &pq_sig))
    }

    /// Both component signatures must verify
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> CryptoResult<bool> {
        let (classic_key, pq_key) = split_composite(public_key, CompositeKind::Key)?;
        let (classic_sig, pq_sig) = split_composite(signature, CompositeKind::Signature)?;

        let classic_ok = ed25519_verify(data, classic_sig, classic_key)?;
        let pq_ok = mldsa_verify(data, pq_sig, pq_key)?;
        Ok(classic_ok && pq_ok)
    }
}

impl CryptoProvider for HybridProvider {
    fn kind(&self) -> ProviderKind {
        match self.backend {
            PqcBackend::Native => ProviderKind::HybridNative,
            PqcBackend::Fallback => ProviderKind::HybridFallback,
        }
    }

    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Hybrid
    }

    fn suite_name(&self) -> &'static str {
        "X25519MLKEM768+Ed25519MLDSA65"
    }

    fn generate_key_pair(&self, purpose: KeyPurpose) -> CryptoResult<KeyPair> {
        let (classic, post_quantum) = match purpose {
            KeyPurpose::KeyExchange => (x25519_generate(), mlkem_generate()),
            KeyPurpose::Signing => (ed25519_generate()?, mldsa_generate()),
        };
        Ok(KeyPair {
            public_key: join_composite(&classic.public_key, &post_quantum.public_key),
            private_key: join_composite(&classic.private_key, &post_quantum.private_key),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum CompositeKind {
    Key,
    Signature,
}

fn join_composite(classic: &[u8], post_quantum: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + classic.len() + post_quantum.len());
    out.extend_from_slice(&(classic.len() as u16).to_be_bytes());
    out.extend_from_slice(classic);
    out.extend_from_slice(post_quantum);
    out
}

fn split_composite(bytes: &[u8], kind: CompositeKind) -> CryptoResult<(&[u8], &[u8])> {
    let malformed = |reason: &str| match kind {
        CompositeKind::Key => CryptoError::InvalidKeyFormat(format!("hybrid key: {}", reason)),
        CompositeKind::Signature => {
            CryptoError::InvalidSignatureEncoding(format!("hybrid signature: {}", reason))
        }
    };

    if bytes.len() < 2 {
        return Err(malformed("missing length prefix"));
    }
    let classic_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if classic_len == 0 || classic_len >= rest.len() {
        return Err(malformed("component length out of range"));
    }
    Ok(rest.split_at(classic_len))
}
