/**
 * crypto/classic.rs
 *
 * Classic provider: X25519 ephemeral-static KEM and Ed25519 signatures
 */

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::kdf::{self, CLASSIC_KEM_CONTEXT};
use super::types::{
    CryptoAlgorithm, CryptoError, CryptoResult, Encapsulation, KeyPair, KeyPurpose, SharedSecret,
};
use super::{CryptoProvider, KeyEncapsulation, ProviderKind, SignatureScheme};

pub(crate) const X25519_KEY_LEN: usize = 32;

/// Classic provider
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassicProvider;

impl ClassicProvider {
    pub fn new() -> Self {
        Self
    }
}

impl KeyEncapsulation for ClassicProvider {
    fn encapsulate(&self, peer_public_key: &[u8]) -> CryptoResult<Encapsulation> {
        let peer = parse_x25519_public(peer_public_key)?;
        let (ephemeral_public, raw) = x25519_agree_ephemeral(&peer)?;

        let shared_secret = kdf::derive_secret(
            CLASSIC_KEM_CONTEXT,
            &[&raw, &ephemeral_public, peer.as_bytes()],
        );
        debug!(
            "X25519 encapsulation to {}",
            kdf::fingerprint(peer.as_bytes())
        );

        Ok(Encapsulation {
            shared_secret,
            encapsulated_key: ephemeral_public.to_vec(),
        })
    }

    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &[u8]) -> CryptoResult<SharedSecret> {
        let ephemeral = parse_x25519_public(encapsulated_key)?;
        let secret = parse_x25519_secret(private_key)?;
        let own_public = PublicKey::from(&secret);

        let raw = x25519_agree_static(&secret, &ephemeral)?;
        Ok(kdf::derive_secret(
            CLASSIC_KEM_CONTEXT,
            &[&raw, ephemeral.as_bytes(), own_public.as_bytes()],
        ))
    }
}

impl SignatureScheme for ClassicProvider {
    fn sign(&self, data: &[u8], private_key: &[u8]) -> CryptoResult<Vec<u8>> {
        ed25519_sign(data, private_key)
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> CryptoResult<bool> {
        ed25519_verify(data, signature, public_key)
    }
}

impl CryptoProvider for ClassicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Classic
    }

    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::Classic
    }

    fn suite_name(&self) -> &'static str {
        "X25519+Ed25519"
    }

    fn generate_key_pair(&self, purpose: KeyPurpose) -> CryptoResult<KeyPair> {
        match purpose {
            KeyPurpose::KeyExchange => Ok(x25519_generate()),
            KeyPurpose::Signing => ed25519_generate(),
        }
    }
}

pub(crate) fn x25519_generate() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        public_key: public.to_bytes().to_vec(),
        private_key: secret.to_bytes().to_vec(),
    }
}

/// Curve25519 u-coordinates of small order, top bit cleared
const LOW_ORDER_POINTS: [[u8; X25519_KEY_LEN]; 7] = [
    [0; 32],
    [
        0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ],
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    field_edge(0xec),
    field_edge(0xed),
    field_edge(0xee),
];

/// p - 1, p and p + 1 differ only in the low byte
const fn field_edge(low: u8) -> [u8; X25519_KEY_LEN] {
    let mut out = [0xff; X25519_KEY_LEN];
    out[0] = low;
    out[31] = 0x7f;
    out
}

/// Decode an X25519 public key. Small-order points are rejected before
/// any agreement runs.
pub(crate) fn parse_x25519_public(bytes: &[u8]) -> CryptoResult<PublicKey> {
    let raw: [u8; X25519_KEY_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKeyFormat(format!(
            "X25519 public key must be {} bytes, got {}",
            X25519_KEY_LEN,
            bytes.len()
        ))
    })?;

    // X25519 ignores the top bit of the encoding
    let mut masked = raw;
    masked[31] &= 0x7f;
    if LOW_ORDER_POINTS.contains(&masked) {
        return Err(CryptoError::InvalidKeyFormat(
            "X25519 public key is a low-order point".into(),
        ));
    }
    Ok(PublicKey::from(raw))
}

pub(crate) fn parse_x25519_secret(bytes: &[u8]) -> CryptoResult<StaticSecret> {
    let raw: [u8; X25519_KEY_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKeyFormat(format!(
            "X25519 private key must be {} bytes, got {}",
            X25519_KEY_LEN,
            bytes.len()
        ))
    })?;
    Ok(StaticSecret::from(raw))
}

/// Fresh ephemeral agreement with `peer`; returns (ephemeral public, raw DH output)
pub(crate) fn x25519_agree_ephemeral(
    peer: &PublicKey,
) -> CryptoResult<([u8; X25519_KEY_LEN], [u8; X25519_KEY_LEN])> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKeyFormat(
            "peer key is a low-order point".into(),
        ));
    }
    Ok((ephemeral_public.to_bytes(), *shared.as_bytes()))
}

pub(crate) fn x25519_agree_static(
    secret: &StaticSecret,
    ephemeral: &PublicKey,
) -> CryptoResult<[u8; X25519_KEY_LEN]> {
    let shared = secret.diffie_hellman(ephemeral);
    if !shared.was_contributory() {
        return Err(CryptoError::DecapsulationFailed(
            "encapsulated key is a low-order point".into(),
        ));
    }
    Ok(*shared.as_bytes())
}

/// Ed25519 key pair, PKCS#8 DER private key and SPKI DER public key
pub(crate) fn ed25519_generate() -> CryptoResult<KeyPair> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let private_der = signing_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::GenerationFailed(format!("PKCS#8 encoding: {}", e)))?;
    let public_der = signing_key
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| CryptoError::GenerationFailed(format!("SPKI encoding: {}", e)))?;

    Ok(KeyPair {
        public_key: public_der.as_bytes().to_vec(),
        private_key: private_der.as_bytes().to_vec(),
    })
}

pub(crate) fn ed25519_sign(data: &[u8], private_der: &[u8]) -> CryptoResult<Vec<u8>> {
    let signing_key = SigningKey::from_pkcs8_der(private_der)
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("Ed25519 private key: {}", e)))?;
    Ok(signing_key.sign(data).to_bytes().to_vec())
}

/// `Ok(false)` for a well-formed signature that does not verify
pub(crate) fn ed25519_verify(data: &[u8], signature: &[u8], public_der: &[u8]) -> CryptoResult<bool> {
    let verifying_key = VerifyingKey::from_public_key_der(public_der)
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("Ed25519 public key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidSignatureEncoding(format!("Ed25519: {}", e)))?;
    Ok(verifying_key.verify_strict(data, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kem_round_trip() {
        let provider = ClassicProvider::new();
        let recipient = provider.generate_key_pair(KeyPurpose::KeyExchange).unwrap();

        let sent = provider.encapsulate(&recipient.public_key).unwrap();
        let received = provider
            .decapsulate(&sent.encapsulated_key, &recipient.private_key)
            .unwrap();

        assert_eq!(sent.shared_secret, received);
        assert_eq!(sent.encapsulated_key.len(), X25519_KEY_LEN);
    }

    #[test]
    fn fresh_encapsulations_differ() {
        let provider = ClassicProvider::new();
        let recipient = provider.generate_key_pair(KeyPurpose::KeyExchange).unwrap();

        let a = provider.encapsulate(&recipient.public_key).unwrap();
        let b = provider.encapsulate(&recipient.public_key).unwrap();
        assert_ne!(a.encapsulated_key, b.encapsulated_key);
        assert_ne!(a.shared_secret, b.shared_secret);
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        let provider = ClassicProvider::new();
        let err = provider.encapsulate(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));

        let err = provider.encapsulate(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));
    }

    #[test]
    fn low_order_peer_keys_fail_as_invalid_format() {
        let provider = ClassicProvider::new();

        let mut zero_with_top_bit = [0u8; 32];
        zero_with_top_bit[31] = 0x80;

        for key in LOW_ORDER_POINTS.iter().copied().chain([zero_with_top_bit]) {
            let err = provider.encapsulate(&key).unwrap_err();
            assert!(matches!(err, CryptoError::InvalidKeyFormat(_)), "{:02x?}", key);
        }

        // Non-canonical p + 1 with the top bit set
        let mut p_plus_one = field_edge(0xee);
        p_plus_one[31] |= 0x80;
        assert!(matches!(
            provider.encapsulate(&p_plus_one),
            Err(CryptoError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn malformed_decapsulation_inputs_are_rejected() {
        let provider = ClassicProvider::new();
        let recipient = provider.generate_key_pair(KeyPurpose::KeyExchange).unwrap();

        let err = provider.decapsulate(&[7u8; 31], &recipient.private_key).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));

        let sent = provider.encapsulate(&recipient.public_key).unwrap();
        let err = provider.decapsulate(&sent.encapsulated_key, &[1u8; 8]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));
    }

    #[test]
    fn signatures_verify_and_reject_tampering() {
        let provider = ClassicProvider::new();
        let keys = provider.generate_key_pair(KeyPurpose::Signing).unwrap();

        let signature = provider.sign(b"device identity", &keys.private_key).unwrap();
        assert!(provider
            .verify(b"device identity", &signature, &keys.public_key)
            .unwrap());
        assert!(!provider
            .verify(b"someone else", &signature, &keys.public_key)
            .unwrap());

        let mut tampered = signature.clone();
        tampered[10] ^= 0x01;
        assert!(!provider
            .verify(b"device identity", &tampered, &keys.public_key)
            .unwrap());
    }

    #[test]
    fn unparsable_signature_or_key_is_an_error() {
        let provider = ClassicProvider::new();
        let keys = provider.generate_key_pair(KeyPurpose::Signing).unwrap();

        let err = provider
            .verify(b"data", &[0u8; 12], &keys.public_key)
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignatureEncoding(_)));

        let err = provider.verify(b"data", &[0u8; 64], b"not der").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));

        let err = provider.sign(b"data", b"not der").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyFormat(_)));
    }
}
