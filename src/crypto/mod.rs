/**
 * crypto/mod.rs
 *
 * Crypto provider capability and policy-driven provider selection:
 * - KeyEncapsulation / SignatureScheme capabilities
 * - Classic, post-quantum and hybrid providers
 * - Runtime capability detection and the provider factory
 */

mod classic;
#[cfg(feature = "pqc")]
mod hybrid;
pub mod kdf;
#[cfg(feature = "pqc")]
mod pqc;
mod types;

pub use classic::ClassicProvider;
#[cfg(feature = "pqc")]
pub use hybrid::HybridProvider;
#[cfg(feature = "pqc")]
pub use pqc::PqcProvider;
pub use types::{
    CryptoAlgorithm, CryptoError, CryptoResult, Encapsulation, KeyPair, KeyPurpose,
    SelectionPolicy, SharedSecret, SHARED_SECRET_LEN,
};

use std::sync::Arc;
use tracing::{info, warn};

/// Key encapsulation capability
pub trait KeyEncapsulation: Send + Sync {
    /// Derive a fresh shared secret for the holder of `peer_public_key`
    fn encapsulate(&self, peer_public_key: &[u8]) -> CryptoResult<Encapsulation>;

    /// Recover the secret from the peer's encapsulated value
    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &[u8]) -> CryptoResult<SharedSecret>;
}

/// Signature capability
pub trait SignatureScheme: Send + Sync {
    fn sign(&self, data: &[u8], private_key: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Returns `Ok(false)` for a well-formed signature that does not verify,
    /// and an error only when the key or signature cannot be decoded.
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> CryptoResult<bool>;
}

/// Full provider capability. Callers never depend on the concrete type.
pub trait CryptoProvider: KeyEncapsulation + SignatureScheme {
    fn kind(&self) -> ProviderKind;

    fn algorithm(&self) -> CryptoAlgorithm;

    /// Human readable suite, reported to presence observers
    fn suite_name(&self) -> &'static str;

    fn is_pqc(&self) -> bool {
        self.algorithm().is_post_quantum()
    }

    fn generate_key_pair(&self, purpose: KeyPurpose) -> CryptoResult<KeyPair>;
}

/// Where the post-quantum primitives come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PqcBackend {
    /// Platform supplied PQC support
    Native,
    /// Linked PQC library
    Fallback,
}

/// Concrete provider variant chosen by the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Classic,
    NativePqc,
    FallbackPqc,
    HybridNative,
    HybridFallback,
}

impl ProviderKind {
    pub fn is_pqc(&self) -> bool {
        !matches!(self, ProviderKind::Classic)
    }
}

/// Post-quantum backends available to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeCapabilities {
    pub native_pqc: bool,
    pub fallback_pqc: bool,
}

impl RuntimeCapabilities {
    /// There is no platform PQC API to probe from a portable build, so only
    /// the linked library (the `pqc` feature) is reported.
    pub fn detect() -> Self {
        Self {
            native_pqc: false,
            fallback_pqc: cfg!(feature = "pqc"),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Drop capabilities the build cannot back with an implementation
    fn usable(self) -> Self {
        if cfg!(feature = "pqc") {
            self
        } else {
            Self::none()
        }
    }
}

/// Pure selection rule: native beats fallback, classic only when no PQC
/// backend exists at all (or the policy asks for it).
pub fn select_backend(policy: SelectionPolicy, caps: RuntimeCapabilities) -> ProviderKind {
    match policy {
        SelectionPolicy::ClassicOnly => ProviderKind::Classic,
        SelectionPolicy::PreferPostQuantum => {
            if caps.native_pqc {
                ProviderKind::NativePqc
            } else if caps.fallback_pqc {
                ProviderKind::FallbackPqc
            } else {
                ProviderKind::Classic
            }
        }
        SelectionPolicy::Hybrid => {
            if caps.native_pqc {
                ProviderKind::HybridNative
            } else if caps.fallback_pqc {
                ProviderKind::HybridFallback
            } else {
                ProviderKind::Classic
            }
        }
    }
}

/// Builds providers from a selection policy
pub struct CryptoProviderFactory;

impl CryptoProviderFactory {
    /// Select a provider using the detected runtime capabilities
    pub fn create(policy: SelectionPolicy) -> Arc<dyn CryptoProvider> {
        Self::create_with_capabilities(policy, RuntimeCapabilities::detect())
    }

    pub fn create_with_capabilities(
        policy: SelectionPolicy,
        caps: RuntimeCapabilities,
    ) -> Arc<dyn CryptoProvider> {
        let kind = select_backend(policy, caps.usable());

        if kind == ProviderKind::Classic && policy != SelectionPolicy::ClassicOnly {
            warn!(
                "No post-quantum backend available for {:?}, using classic provider",
                policy
            );
        } else {
            info!("Selected crypto provider {:?} for {:?}", kind, policy);
        }

        Self::build(kind)
    }

    #[cfg(feature = "pqc")]
    fn build(kind: ProviderKind) -> Arc<dyn CryptoProvider> {
        match kind {
            ProviderKind::Classic => Arc::new(ClassicProvider::new()),
            ProviderKind::NativePqc => Arc::new(PqcProvider::new(PqcBackend::Native)),
            ProviderKind::FallbackPqc => Arc::new(PqcProvider::new(PqcBackend::Fallback)),
            ProviderKind::HybridNative => Arc::new(HybridProvider::new(PqcBackend::Native)),
            ProviderKind::HybridFallback => Arc::new(HybridProvider::new(PqcBackend::Fallback)),
        }
    }

    #[cfg(not(feature = "pqc"))]
    fn build(_kind: ProviderKind) -> Arc<dyn CryptoProvider> {
        Arc::new(ClassicProvider::new())
    }
}
