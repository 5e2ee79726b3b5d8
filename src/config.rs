/**
 * config.rs
 *
 * Externally supplied configuration for the core
 */

use serde::{Deserialize, Serialize};

use crate::crypto::SelectionPolicy;
use crate::nat_traversal::NatTraversalConfig;
use crate::transport::TransportConfig;

/// Crypto selection settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub policy: SelectionPolicy,
}

/// Complete core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub nat: NatTraversalConfig,
    pub transport: TransportConfig,
    pub crypto: CryptoConfig,
}

impl CoreConfig {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
