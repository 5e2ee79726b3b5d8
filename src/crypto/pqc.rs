/**
 * crypto/pqc.rs
 *
 * Post-quantum provider: ML-KEM-768 encapsulation and ML-DSA-65 signatures
 */

use ml_dsa::signature::{Signer, Verifier};
use ml_dsa::{
    EncodedSignature, EncodedSigningKey, EncodedVerifyingKey, KeyGen, MlDsa65,
    Signature as MlDsaSignature, SigningKey as MlDsaSigningKey,
    VerifyingKey as MlDsaVerifyingKey,
};
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use tracing::debug;

use super::kdf::{self, PQC_KEM_CONTEXT};
use super::types::{
    CryptoAlgorithm, CryptoError, CryptoResult, Encapsulation, KeyPair, KeyPurpose, SharedSecret,
};
use super::{CryptoProvider, KeyEncapsulation, PqcBackend, ProviderKind, SignatureScheme};

type MlKemEncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;
type MlKemDecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;

pub(crate) const MLKEM768_PUBLIC_KEY_LEN: usize = 1184;
pub(crate) const MLKEM768_PRIVATE_KEY_LEN: usize = 2400;
pub(crate) const MLKEM768_CIPHERTEXT_LEN: usize = 1088;
pub(crate) const MLDSA65_PUBLIC_KEY_LEN: usize = 1952;
pub(crate) const MLDSA65_PRIVATE_KEY_LEN: usize = 4032;
pub(crate) const MLDSA65_SIGNATURE_LEN: usize = 3309;

/// Post-quantum provider
#[derive(Debug, Clone, Copy)]
pub struct PqcProvider {
    backend: PqcBackend,
}

impl PqcProvider {
    pub fn new(backend: PqcBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> PqcBackend {
        self.backend
    }
}

impl KeyEncapsulation for PqcProvider {
    fn encapsulate(&self, peer_public_key: &[u8]) -> CryptoResult<Encapsulation> {
        let peer = parse_mlkem_public(peer_public_key)?;
        let (ciphertext, raw) = mlkem_encapsulate(&peer)?;

        debug!(
            "ML-KEM-768 encapsulation to {} ({:?} backend)",
            kdf::fingerprint(peer_public_key),
            self.backend
        );

        Ok(Encapsulation {
            shared_secret: kdf::derive_secret(PQC_KEM_CONTEXT, &[&raw, &ciphertext]),
            encapsulated_key: ciphertext,
        })
    }

    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &[u8]) -> CryptoResult<SharedSecret> {
        let ciphertext = parse_mlkem_ciphertext(encapsulated_key)?;
        let secret = parse_mlkem_private(private_key)?;
        let raw = mlkem_decapsulate(&secret, &ciphertext)?;
        Ok(kdf::derive_secret(PQC_KEM_CONTEXT, &[&raw, encapsulated_key]))
    }
}

impl SignatureScheme for PqcProvider {
    fn sign(&self, data: &[u8], private_key: &[u8]) -> CryptoResult<Vec<u8>> {
        mldsa_sign(data, private_key)
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> CryptoResult<bool> {
        mldsa_verify(data, signature, public_key)
    }
}

impl CryptoProvider for PqcProvider {
    fn kind(&self) -> ProviderKind {
        match self.backend {
            PqcBackend::Native => ProviderKind::NativePqc,
            PqcBackend::Fallback => ProviderKind::FallbackPqc,
        }
    }

    fn algorithm(&self) -> CryptoAlgorithm {
        CryptoAlgorithm::PostQuantum
    }

    fn suite_name(&self) -> &'static str {
        "ML-KEM-768+ML-DSA-65"
    }

    fn generate_key_pair(&self, purpose: KeyPurpose) -> CryptoResult<KeyPair> {
        match purpose {
            KeyPurpose::KeyExchange => Ok(mlkem_generate()),
            KeyPurpose::Signing => Ok(mldsa_generate()),
        }
    }
}

pub(crate) fn mlkem_generate() -> KeyPair {
    let (decapsulation_key, encapsulation_key) = MlKem768::generate(&mut OsRng);
    KeyPair {
        public_key: encapsulation_key.as_bytes().to_vec(),
        private_key: decapsulation_key.as_bytes().to_vec(),
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> CryptoResult<()> {
    if bytes.len() != expected {
        return Err(CryptoError::InvalidKeyFormat(format!(
            "{} must be {} bytes, got {}",
            what,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

pub(crate) fn parse_mlkem_public(bytes: &[u8]) -> CryptoResult<MlKemEncapsulationKey> {
    check_len("ML-KEM-768 public key", bytes, MLKEM768_PUBLIC_KEY_LEN)?;
    let encoded = Encoded::<MlKemEncapsulationKey>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-KEM-768 public key".into()))?;
    Ok(MlKemEncapsulationKey::from_bytes(&encoded))
}

pub(crate) fn parse_mlkem_private(bytes: &[u8]) -> CryptoResult<MlKemDecapsulationKey> {
    check_len("ML-KEM-768 private key", bytes, MLKEM768_PRIVATE_KEY_LEN)?;
    let encoded = Encoded::<MlKemDecapsulationKey>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-KEM-768 private key".into()))?;
    Ok(MlKemDecapsulationKey::from_bytes(&encoded))
}

pub(crate) fn parse_mlkem_ciphertext(bytes: &[u8]) -> CryptoResult<Ciphertext<MlKem768>> {
    check_len("ML-KEM-768 ciphertext", bytes, MLKEM768_CIPHERTEXT_LEN)?;
    Ciphertext::<MlKem768>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-KEM-768 ciphertext".into()))
}

/// Returns (ciphertext, raw shared key)
pub(crate) fn mlkem_encapsulate(peer: &MlKemEncapsulationKey) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    let (ciphertext, shared) = peer
        .encapsulate(&mut OsRng)
        .map_err(|_| CryptoError::EncapsulationFailed("ML-KEM-768 encapsulate".into()))?;
    Ok((ciphertext.to_vec(), shared.to_vec()))
}

pub(crate) fn mlkem_decapsulate(
    secret: &MlKemDecapsulationKey,
    ciphertext: &Ciphertext<MlKem768>,
) -> CryptoResult<Vec<u8>> {
    let shared = secret
        .decapsulate(ciphertext)
        .map_err(|_| CryptoError::DecapsulationFailed("ML-KEM-768 decapsulate".into()))?;
    Ok(shared.to_vec())
}

pub(crate) fn mldsa_generate() -> KeyPair {
    let pair = MlDsa65::key_gen(&mut OsRng);
    KeyPair {
        public_key: pair.verifying_key().encode().to_vec(),
        private_key: pair.signing_key().encode().to_vec(),
    }
}

pub(crate) fn mldsa_sign(data: &[u8], private_key: &[u8]) -> CryptoResult<Vec<u8>> {
    check_len("ML-DSA-65 private key", private_key, MLDSA65_PRIVATE_KEY_LEN)?;
    let encoded = EncodedSigningKey::<MlDsa65>::try_from(private_key)
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-DSA-65 private key".into()))?;
    let signing_key = MlDsaSigningKey::<MlDsa65>::decode(&encoded);
    let signature: MlDsaSignature<MlDsa65> = signing_key
        .try_sign(data)
        .map_err(|e| CryptoError::SigningFailed(format!("ML-DSA-65: {}", e)))?;
    Ok(signature.encode().to_vec())
}

/// `Ok(false)` for a well-formed signature that does not verify
pub(crate) fn mldsa_verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> CryptoResult<bool> {
    check_len("ML-DSA-65 public key", public_key, MLDSA65_PUBLIC_KEY_LEN)?;
    if signature.len() != MLDSA65_SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignatureEncoding(format!(
            "ML-DSA-65 signature must be {} bytes, got {}",
            MLDSA65_SIGNATURE_LEN,
            signature.len()
        )));
    }

    let encoded_key = EncodedVerifyingKey::<MlDsa65>::try_from(public_key)
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-DSA-65 public key".into()))?;
    let verifying_key = MlDsaVerifyingKey::<MlDsa65>::decode(&encoded_key);

    let encoded_signature = EncodedSignature::<MlDsa65>::try_from(signature)
        .map_err(|_| CryptoError::InvalidSignatureEncoding("ML-DSA-65 signature".into()))?;
    let signature = MlDsaSignature::<MlDsa65>::decode(&encoded_signature).ok_or_else(|| {
        CryptoError::InvalidSignatureEncoding("ML-DSA-65 signature hint encoding".into())
    })?;

    Ok(verifying_key.verify(data, &signature).is_ok())
}
