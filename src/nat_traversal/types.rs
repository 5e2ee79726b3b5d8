/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default public STUN reflectors
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// NAT behavior classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    NoNat,
    Unknown,
}

impl NatType {
    /// Whether direct hole punching is expected to work
    pub fn is_traversable(&self) -> bool {
        matches!(
            self,
            NatType::NoNat | NatType::FullCone | NatType::RestrictedCone | NatType::PortRestrictedCone
        )
    }
}

/// Traversal state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalState {
    Idle,
    Detecting,
    Connecting,
    Connected,
    Failed(String),
}

/// Device handed over by the discovery layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device_id: String,
    /// Candidate endpoints, best first, as `host:port`
    pub endpoints: Vec<String>,
    pub display_name: String,
}

/// Hole punching session, owned by the traversal manager
#[derive(Debug, Clone)]
pub struct HolePunchingSession {
    pub session_id: Uuid,
    pub target: DiscoveredDevice,
    pub created_at: DateTime<Utc>,
    pub state: TraversalState,
}

impl HolePunchingSession {
    pub fn new(target: DiscoveredDevice) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            target,
            created_at: Utc::now(),
            state: TraversalState::Idle,
        }
    }
}

/// Connection attempt counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraversalStatistics {
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Parsed `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port`, `[v6]:port` or `a.b.c.d:port`
    pub fn parse(raw: &str) -> NatResult<Self> {
        let invalid = || NatTraversalError::InvalidEndpoint(raw.to_string());

        let (host, port) = raw.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            // Unbracketed IPv6 is ambiguous
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// NAT traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatTraversalConfig {
    /// STUN reflectors (host:port), tried in order
    pub stun_servers: Vec<String>,

    /// Per-request STUN timeout
    #[serde(with = "duration_ms")]
    pub stun_timeout: Duration,

    /// Local UDP port for STUN and the punch listener (0 for random)
    pub local_port: u16,

    /// Interval between punch probes
    #[serde(with = "duration_ms")]
    pub punch_interval: Duration,

    /// Give up on a direct connection after this long
    #[serde(with = "duration_ms")]
    pub punch_timeout: Duration,
}

impl Default for NatTraversalConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            stun_timeout: Duration::from_secs(3),
            local_port: 0,
            punch_interval: Duration::from_millis(200),
            punch_timeout: Duration::from_secs(10),
        }
    }
}

/// NAT traversal errors
#[derive(Debug, Error)]
pub enum NatTraversalError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no endpoints available for device {0}")]
    NoEndpointsAvailable(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection cancelled")]
    ConnectionCancelled,

    #[error("hole punching session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("STUN protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NatResult<T> = Result<T, NatTraversalError>;

/// Serialize durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_endpoints() {
        let e = Endpoint::parse("192.168.1.20:9090").unwrap();
        assert_eq!((e.host.as_str(), e.port), ("192.168.1.20", 9090));

        let e = Endpoint::parse("peer.local:443").unwrap();
        assert_eq!(e.host, "peer.local");

        let e = Endpoint::parse("[fe80::1]:5000").unwrap();
        assert_eq!(e.host, "fe80::1");
        assert_eq!(e.to_string(), "[fe80::1]:5000");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        for raw in ["", "host", ":9090", "host:", "host:0", "host:70000", "fe80::1:80", "[::1:80", "a b:1"] {
            assert!(
                matches!(Endpoint::parse(raw), Err(NatTraversalError::InvalidEndpoint(_))),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn config_round_trips_through_json_with_millis() {
        let json = r#"{"stun_servers":["127.0.0.1:3478"],"stun_timeout":250}"#;
        let config: NatTraversalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stun_timeout, Duration::from_millis(250));
        assert_eq!(config.punch_interval, Duration::from_millis(200));
    }

    #[test]
    fn traversable_types() {
        assert!(NatType::NoNat.is_traversable());
        assert!(NatType::PortRestrictedCone.is_traversable());
        assert!(!NatType::Symmetric.is_traversable());
        assert!(!NatType::Unknown.is_traversable());
    }
}
