/**
 * legacy_trust.rs
 *
 * Legacy trust precondition gate
 *
 * Decides whether the classic signature algorithm may anchor a device
 * identity. Everything here is pure; verification only runs after the
 * precondition has been checked.
 */

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{ClassicProvider, CryptoError, SignatureScheme};

/// Diagnostic reason attached to the unsatisfied sentinel
pub const PURE_NETWORK_STRANGER: &str = "pure network stranger";

/// Default lifetime of a pairing context
pub const DEFAULT_PAIRING_MAX_AGE_SECS: i64 = 600;

/// How two devices made first contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingChannel {
    QrCode,
    PinPake,
    LocalShortRange,
    NetworkDiscovery,
}

impl PairingChannel {
    /// Network discovery never counts as an authenticated channel
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, PairingChannel::NetworkDiscovery)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PairingChannel::QrCode => "qr_code",
            PairingChannel::PinPake => "pin_pake",
            PairingChannel::LocalShortRange => "local_short_range",
            PairingChannel::NetworkDiscovery => "network_discovery",
        }
    }
}

/// First-contact context handed over by the pairing flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingContext {
    pub channel: PairingChannel,
    pub is_verified: bool,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl PairingContext {
    pub fn new(channel: PairingChannel, is_verified: bool, session_id: impl Into<String>) -> Self {
        Self {
            channel,
            is_verified,
            session_id: session_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }
}

/// Per-device trust record, owned by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub device_id: String,
    /// Classic public key bound to this device, if any
    pub legacy_public_key: Option<Vec<u8>>,
    pub allows_legacy_fallback: bool,
}

/// Which rule produced a precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionType {
    AuthenticatedChannel,
    ExistingTrustRecord,
    LocalConnection,
}

impl fmt::Display for PreconditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PreconditionType::AuthenticatedChannel => "authenticated_channel",
            PreconditionType::ExistingTrustRecord => "existing_trust_record",
            PreconditionType::LocalConnection => "local_connection",
        };
        f.write_str(name)
    }
}

/// Outcome of the gate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTrustPrecondition {
    kind: PreconditionType,
    is_satisfied: bool,
    context: BTreeMap<String, String>,
}

impl LegacyTrustPrecondition {
    /// The "pure network stranger" sentinel
    pub fn unsatisfied() -> Self {
        let mut context = BTreeMap::new();
        context.insert("reason".to_string(), PURE_NETWORK_STRANGER.to_string());
        Self {
            kind: PreconditionType::AuthenticatedChannel,
            is_satisfied: false,
            context,
        }
    }

    /// Precondition for a connection the transport flagged as local (wired, loopback)
    pub fn local_connection(device_id: &str, is_local: bool) -> Self {
        if !is_local {
            return Self::unsatisfied();
        }
        let mut context = BTreeMap::new();
        context.insert("device_id".to_string(), device_id.to_string());
        context.insert("reason".to_string(), "connection is local".to_string());
        Self {
            kind: PreconditionType::LocalConnection,
            is_satisfied: true,
            context,
        }
    }

    pub fn kind(&self) -> PreconditionType {
        self.kind
    }

    pub fn is_satisfied(&self) -> bool {
        self.is_satisfied
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

/// Trust gate errors
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("legacy trust precondition not satisfied: {0}")]
    PreconditionNotSatisfied(PreconditionType),

    #[error("no legacy public key bound to device")]
    LegacyPublicKeyMissing,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type TrustResult<T> = Result<T, TrustError>;

/// Legacy trust precondition gate
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyTrustGate;

impl LegacyTrustGate {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate, in priority order: trust record, authenticated pairing
    /// channel, otherwise the unsatisfied sentinel.
    pub fn check(
        &self,
        device_id: &str,
        trust_record: Option<&TrustRecord>,
        pairing_context: Option<&PairingContext>,
    ) -> LegacyTrustPrecondition {
        // A record only speaks for the device it was issued to
        if let Some(record) =
            trust_record.filter(|r| r.allows_legacy_fallback && r.device_id == device_id)
        {
            let mut context = BTreeMap::new();
            context.insert("device_id".to_string(), device_id.to_string());
            context.insert("record_device_id".to_string(), record.device_id.clone());
            context.insert(
                "reason".to_string(),
                "trust record permits legacy fallback".to_string(),
            );
            debug!("Legacy trust for {} satisfied by trust record", device_id);
            return LegacyTrustPrecondition {
                kind: PreconditionType::ExistingTrustRecord,
                is_satisfied: true,
                context,
            };
        }

        if let Some(pairing) = pairing_context.filter(|p| p.channel.is_authenticated()) {
            let mut context = BTreeMap::new();
            context.insert("device_id".to_string(), device_id.to_string());
            context.insert("channel".to_string(), pairing.channel.as_str().to_string());
            context.insert("session_id".to_string(), pairing.session_id.clone());
            context.insert("verified".to_string(), pairing.is_verified.to_string());
            if !pairing.is_verified {
                context.insert("reason".to_string(), "pairing not verified".to_string());
            }
            debug!(
                "Legacy trust for {} via {} pairing: verified={}",
                device_id,
                pairing.channel.as_str(),
                pairing.is_verified
            );
            return LegacyTrustPrecondition {
                kind: PreconditionType::AuthenticatedChannel,
                is_satisfied: pairing.is_verified,
                context,
            };
        }

        debug!("Legacy trust for {}: {}", device_id, PURE_NETWORK_STRANGER);
        LegacyTrustPrecondition::unsatisfied()
    }

    pub fn require_satisfied(&self, precondition: &LegacyTrustPrecondition) -> TrustResult<()> {
        if precondition.is_satisfied() {
            Ok(())
        } else {
            warn!(
                "Blocked legacy path: {} ({:?})",
                precondition.kind(),
                precondition.context().get("reason")
            );
            Err(TrustError::PreconditionNotSatisfied(precondition.kind()))
        }
    }

    /// Verify a classic signature, but only behind a satisfied precondition
    pub fn verify_legacy_signature(
        &self,
        precondition: &LegacyTrustPrecondition,
        legacy_public_key: Option<&[u8]>,
        data: &[u8],
        signature: &[u8],
    ) -> TrustResult<bool> {
        self.require_satisfied(precondition)?;
        let public_key = legacy_public_key.ok_or(TrustError::LegacyPublicKeyMissing)?;
        Ok(ClassicProvider::new().verify(data, signature, public_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, KeyPurpose};

    const CHANNELS: [PairingChannel; 4] = [
        PairingChannel::QrCode,
        PairingChannel::PinPake,
        PairingChannel::LocalShortRange,
        PairingChannel::NetworkDiscovery,
    ];

    fn record(allows: bool) -> TrustRecord {
        TrustRecord {
            device_id: "device-a".into(),
            legacy_public_key: None,
            allows_legacy_fallback: allows,
        }
    }

    #[test]
    fn satisfied_only_when_explicitly_permitted() {
        let gate = LegacyTrustGate::new();
        let records = [None, Some(record(false)), Some(record(true))];

        for trust in &records {
            for channel in CHANNELS.iter().copied().map(Some).chain([None]) {
                for verified in [false, true] {
                    let pairing = channel.map(|c| PairingContext::new(c, verified, "s-1"));
                    let result = gate.check("device-a", trust.as_ref(), pairing.as_ref());

                    let permitted_by_record =
                        trust.as_ref().map_or(false, |r| r.allows_legacy_fallback);
                    let permitted_by_channel =
                        channel.map_or(false, |c| c.is_authenticated()) && verified;

                    assert_eq!(
                        result.is_satisfied(),
                        permitted_by_record || permitted_by_channel,
                        "record={:?} channel={:?} verified={}",
                        trust,
                        channel,
                        verified
                    );
                }
            }
        }
    }

    #[test]
    fn trust_record_takes_priority() {
        let gate = LegacyTrustGate::new();
        let pairing = PairingContext::new(PairingChannel::QrCode, false, "s-1");
        let result = gate.check("device-a", Some(&record(true)), Some(&pairing));
        assert_eq!(result.kind(), PreconditionType::ExistingTrustRecord);
        assert!(result.is_satisfied());
    }

    #[test]
    fn trust_record_for_another_device_is_ignored() {
        let gate = LegacyTrustGate::new();
        let foreign = TrustRecord {
            device_id: "device-z".into(),
            legacy_public_key: None,
            allows_legacy_fallback: true,
        };

        let result = gate.check("device-a", Some(&foreign), None);
        assert!(!result.is_satisfied());
        assert_ne!(result.kind(), PreconditionType::ExistingTrustRecord);

        // Falls through to the pairing channel
        let pairing = PairingContext::new(PairingChannel::PinPake, true, "s-2");
        let result = gate.check("device-a", Some(&foreign), Some(&pairing));
        assert_eq!(result.kind(), PreconditionType::AuthenticatedChannel);
        assert!(result.is_satisfied());
    }

    #[test]
    fn network_discovery_alone_is_a_stranger() {
        let gate = LegacyTrustGate::new();
        for verified in [false, true] {
            let pairing = PairingContext::new(PairingChannel::NetworkDiscovery, verified, "s-2");
            let result = gate.check("device-b", None, Some(&pairing));
            assert_eq!(result, LegacyTrustPrecondition::unsatisfied());
            assert_eq!(
                result.context().get("reason").map(String::as_str),
                Some(PURE_NETWORK_STRANGER)
            );
        }
    }

    #[test]
    fn unverified_authenticated_channel_is_unsatisfied() {
        let gate = LegacyTrustGate::new();
        let pairing = PairingContext::new(PairingChannel::PinPake, false, "s-3");
        let result = gate.check("device-c", Some(&record(false)), Some(&pairing));
        assert_eq!(result.kind(), PreconditionType::AuthenticatedChannel);
        assert!(!result.is_satisfied());
        assert_eq!(result.context().get("channel").unwrap(), "pin_pake");
    }

    #[test]
    fn require_satisfied_rejects_sentinel() {
        let gate = LegacyTrustGate::new();
        let err = gate
            .require_satisfied(&LegacyTrustPrecondition::unsatisfied())
            .unwrap_err();
        assert!(matches!(
            err,
            TrustError::PreconditionNotSatisfied(PreconditionType::AuthenticatedChannel)
        ));
    }

    #[test]
    fn local_connection_flag() {
        let local = LegacyTrustPrecondition::local_connection("device-d", true);
        assert_eq!(local.kind(), PreconditionType::LocalConnection);
        assert!(local.is_satisfied());
        assert_eq!(
            LegacyTrustPrecondition::local_connection("device-d", false),
            LegacyTrustPrecondition::unsatisfied()
        );
    }

    #[test]
    fn legacy_verification_is_gated() {
        let gate = LegacyTrustGate::new();
        let classic = ClassicProvider::new();
        let keys = classic.generate_key_pair(KeyPurpose::Signing).unwrap();
        let signature = classic.sign(b"hello", &keys.private_key).unwrap();

        let blocked = gate.verify_legacy_signature(
            &LegacyTrustPrecondition::unsatisfied(),
            Some(&keys.public_key),
            b"hello",
            &signature,
        );
        assert!(matches!(blocked, Err(TrustError::PreconditionNotSatisfied(_))));

        let trusted = gate.check("device-a", Some(&record(true)), None);
        let missing = gate.verify_legacy_signature(&trusted, None, b"hello", &signature);
        assert!(matches!(missing, Err(TrustError::LegacyPublicKeyMissing)));

        let ok = gate
            .verify_legacy_signature(&trusted, Some(&keys.public_key), b"hello", &signature)
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn pairing_context_expiry() {
        let mut pairing = PairingContext::new(PairingChannel::QrCode, true, "s-4");
        assert!(!pairing.is_expired(Duration::seconds(DEFAULT_PAIRING_MAX_AGE_SECS)));
        pairing.created_at = Utc::now() - Duration::seconds(DEFAULT_PAIRING_MAX_AGE_SECS + 1);
        assert!(pairing.is_expired(Duration::seconds(DEFAULT_PAIRING_MAX_AGE_SECS)));
    }
}
