/**
 * presence.rs
 *
 * One-way presence notifications for UI-facing observers
 */

use serde::Serialize;
use tracing::info;

use crate::crypto::ProviderKind;

/// Established secure channel, as reported to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerPresence {
    pub peer_id: String,
    pub display_name: String,
    #[serde(serialize_with = "serialize_kind")]
    pub crypto_kind: ProviderKind,
    pub suite_name: String,
}

/// Algorithm upgrade in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RekeyInfo {
    pub peer_id: String,
    #[serde(serialize_with = "serialize_kind")]
    pub from_kind: ProviderKind,
    pub from_suite: String,
    #[serde(serialize_with = "serialize_kind")]
    pub to_kind: ProviderKind,
    pub to_suite: String,
}

/// Fire-and-forget sink. Implementations must not call back into the core.
pub trait PresenceSink: Send + Sync {
    fn peer_connected(&self, presence: &PeerPresence);

    fn peer_disconnected(&self, peer_id: &str);

    fn rekey_started(&self, rekey: &RekeyInfo);

    fn rekey_cleared(&self, peer_id: &str);
}

/// Sink that only writes tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPresence;

impl PresenceSink for LoggingPresence {
    fn peer_connected(&self, presence: &PeerPresence) {
        info!(
            "Peer {} ({}) connected with {}",
            presence.peer_id, presence.display_name, presence.suite_name
        );
    }

    fn peer_disconnected(&self, peer_id: &str) {
        info!("Peer {} disconnected", peer_id);
    }

    fn rekey_started(&self, rekey: &RekeyInfo) {
        info!(
            "Peer {} rekeying {} -> {}",
            rekey.peer_id, rekey.from_suite, rekey.to_suite
        );
    }

    fn rekey_cleared(&self, peer_id: &str) {
        info!("Peer {} rekey cleared", peer_id);
    }
}

fn serialize_kind<S: serde::Serializer>(kind: &ProviderKind, serializer: S) -> Result<S::Ok, S::Error> {
    let name = match kind {
        ProviderKind::Classic => "classic",
        ProviderKind::NativePqc => "native_pqc",
        ProviderKind::FallbackPqc => "fallback_pqc",
        ProviderKind::HybridNative => "hybrid_native",
        ProviderKind::HybridFallback => "hybrid_fallback",
    };
    serializer.serialize_str(name)
}
