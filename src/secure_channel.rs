/**
 * secure_channel.rs
 *
 * AES-256-GCM session channel keyed from a provider's KEM output, and the
 * per-peer registry feeding presence observers
 */

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::crypto::kdf::{self, SESSION_AEAD_CONTEXT};
use crate::crypto::{CryptoError, CryptoProvider, CryptoResult, KeyPair, ProviderKind};
use crate::presence::{PeerPresence, PresenceSink, RekeyInfo};

const NONCE_LEN: usize = 12;

/// Authenticated encryption over an established session key
pub struct SecureChannel {
    cipher: Aes256Gcm,
    kind: ProviderKind,
    suite_name: &'static str,
    key_fingerprint: String,
}

impl SecureChannel {
    /// Encapsulate to `peer_public_key`. Returns the channel and the value
    /// the peer needs for `accept`.
    pub fn initiate(
        provider: &dyn CryptoProvider,
        peer_public_key: &[u8],
    ) -> CryptoResult<(Self, Vec<u8>)> {
        let encapsulation = provider.encapsulate(peer_public_key)?;
        let channel = Self::from_secret(
            provider,
            encapsulation.shared_secret.as_bytes(),
            &encapsulation.encapsulated_key,
        )?;
        Ok((channel, encapsulation.encapsulated_key))
    }

    /// Recover the session from the initiator's encapsulated value
    pub fn accept(
        provider: &dyn CryptoProvider,
        key_pair: &KeyPair,
        encapsulated_key: &[u8],
    ) -> CryptoResult<Self> {
        let secret = provider.decapsulate(encapsulated_key, &key_pair.private_key)?;
        Self::from_secret(provider, secret.as_bytes(), encapsulated_key)
    }

    fn from_secret(
        provider: &dyn CryptoProvider,
        shared_secret: &[u8],
        encapsulated_key: &[u8],
    ) -> CryptoResult<Self> {
        let session_key = kdf::derive_secret(
            SESSION_AEAD_CONTEXT,
            &[shared_secret, provider.algorithm().identifier().as_bytes(), encapsulated_key],
        );
        let cipher = Aes256Gcm::new_from_slice(session_key.as_bytes())
            .map_err(|e| CryptoError::Encrypt(format!("Failed to create cipher: {}", e)))?;

        Ok(Self {
            cipher,
            kind: provider.kind(),
            suite_name: provider.suite_name(),
            key_fingerprint: kdf::fingerprint(session_key.as_bytes()),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn suite_name(&self) -> &'static str {
        self.suite_name
    }

    /// Short digest of the session key, for logs
    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    /// `nonce || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt("Ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

struct PeerChannel {
    display_name: String,
    channel: Arc<SecureChannel>,
}

/// Established channels per peer id
pub struct SecureChannelRegistry {
    channels: RwLock<HashMap<String, PeerChannel>>,
    presence: Arc<dyn PresenceSink>,
}

impl SecureChannelRegistry {
    pub fn new(presence: Arc<dyn PresenceSink>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            presence,
        }
    }

    /// Record a new channel and notify presence. Replaces any previous
    /// channel for the peer.
    pub async fn establish(
        &self,
        peer_id: &str,
        display_name: &str,
        channel: SecureChannel,
    ) -> Arc<SecureChannel> {
        let channel = Arc::new(channel);
        let presence = PeerPresence {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            crypto_kind: channel.kind(),
            suite_name: channel.suite_name().to_string(),
        };

        self.channels.write().await.insert(
            peer_id.to_string(),
            PeerChannel {
                display_name: display_name.to_string(),
                channel: Arc::clone(&channel),
            },
        );
        info!(
            "Secure channel with {} established ({}, key {})",
            peer_id,
            channel.suite_name(),
            channel.key_fingerprint()
        );
        self.presence.peer_connected(&presence);
        channel
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<SecureChannel>> {
        self.channels
            .read()
            .await
            .get(peer_id)
            .map(|peer| Arc::clone(&peer.channel))
    }

    pub async fn peer_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Swap in a channel negotiated with a different algorithm, reporting
    /// the rekey around the swap. Returns false for an unknown peer.
    pub async fn rekey(&self, peer_id: &str, channel: SecureChannel) -> bool {
        let mut channels = self.channels.write().await;
        let Some(peer) = channels.get_mut(peer_id) else {
            return false;
        };

        let rekey = RekeyInfo {
            peer_id: peer_id.to_string(),
            from_kind: peer.channel.kind(),
            from_suite: peer.channel.suite_name().to_string(),
            to_kind: channel.kind(),
            to_suite: channel.suite_name().to_string(),
        };
        self.presence.rekey_started(&rekey);

        peer.channel = Arc::new(channel);
        debug!("Peer {} now on {}", peer_id, peer.channel.suite_name());

        let presence = PeerPresence {
            peer_id: peer_id.to_string(),
            display_name: peer.display_name.clone(),
            crypto_kind: peer.channel.kind(),
            suite_name: peer.channel.suite_name().to_string(),
        };
        self.presence.rekey_cleared(peer_id);
        self.presence.peer_connected(&presence);
        true
    }

    /// Drop the channel and notify presence. No-op for unknown peers.
    pub async fn teardown(&self, peer_id: &str) {
        if self.channels.write().await.remove(peer_id).is_some() {
            info!("Secure channel with {} closed", peer_id);
            self.presence.peer_disconnected(peer_id);
        }
    }
}
