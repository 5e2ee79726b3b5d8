#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 *
 * Secure direct peer-to-peer channels:
 * - NAT detection and hole punching
 * - UDP transport session manager
 * - Classic / post-quantum / hybrid crypto providers
 * - Legacy trust precondition gate
 */

pub mod config;
pub mod crypto;
pub mod legacy_trust;
pub mod nat_traversal;
pub mod presence;
pub mod secure_channel;
pub mod transport;

pub use config::{CoreConfig, CryptoConfig};
pub use crypto::{CryptoProvider, CryptoProviderFactory, SelectionPolicy};
pub use legacy_trust::{LegacyTrustGate, LegacyTrustPrecondition, PairingContext, TrustRecord};
pub use nat_traversal::{NatTraversalConfig, NatTraversalManager, NatType};
pub use presence::{PeerPresence, PresenceSink};
pub use secure_channel::{SecureChannel, SecureChannelRegistry};
pub use transport::{AppEvent, Role, ServiceState, TransportConfig, TransportManager};
