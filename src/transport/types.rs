/**
 * transport/types.rs
 *
 * Core types for the P2P transport session manager
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque connection token
pub type ConnectionId = Uuid;

/// Default listener port
pub const DEFAULT_LISTEN_PORT: u16 = 9090;

/// Ports tried when the requested one is taken (`port + 0..16`)
pub const PORT_FALLBACK_SPAN: u16 = 16;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// How this process takes part in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Binds a local port and accepts inbound peers
    Listener,
    /// Connects outward only
    Dialer,
}

/// Aggregate transport state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Listening(u16),
    Connected,
    Failed(String),
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Idle => write!(f, "idle"),
            ServiceState::Listening(port) => write!(f, "listening on {}", port),
            ServiceState::Connected => write!(f, "connected"),
            ServiceState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-connection state machine: `Setup -> Ready -> Failed | Cancelled`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Setup,
    Ready,
    Failed(String),
    Cancelled,
}

/// Snapshot of one connection table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub peer: SocketAddr,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Preferred listener port
    pub listen_port: u16,

    /// Number of consecutive ports tried on `AddrInUse`
    pub port_fallback_span: u16,

    /// Receive buffer and send limit
    pub max_datagram_size: usize,

    /// Per-connection inbox depth for demultiplexed inbound datagrams
    pub inbox_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            port_fallback_span: PORT_FALLBACK_SPAN,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            inbox_capacity: 256,
        }
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoded event is {len} bytes, limit is {max}")]
    Oversized { len: usize, max: usize },

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("transport is not listening")]
    NotListening,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.port_fallback_span, 16);
        assert_eq!(config.max_datagram_size, 65_507);

        let parsed: TransportConfig = serde_json::from_str(r#"{"listen_port":7000}"#).unwrap();
        assert_eq!(parsed.listen_port, 7000);
        assert_eq!(parsed.port_fallback_span, 16);
    }

    #[test]
    fn state_display() {
        assert_eq!(ServiceState::Listening(9090).to_string(), "listening on 9090");
        assert_eq!(ServiceState::Failed("boom".into()).to_string(), "failed: boom");
    }
}
