/**
 * transport/events.rs
 *
 * Application event protocol: one JSON-encoded event per datagram,
 * discriminated by a `type` field
 */

use serde::{Deserialize, Serialize};

use super::types::{TransportError, TransportResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    Handshake {
        app_version: String,
        device_name: String,
        capabilities: Vec<String>,
    },
    KeepAlive,
    TextMessage {
        text: String,
    },
}

impl AppEvent {
    pub fn handshake(
        app_version: impl Into<String>,
        device_name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        AppEvent::Handshake {
            app_version: app_version.into(),
            device_name: device_name.into(),
            capabilities,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        AppEvent::TextMessage { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::Handshake { .. } => "handshake",
            AppEvent::KeepAlive => "keep_alive",
            AppEvent::TextMessage { .. } => "text_message",
        }
    }

    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(TransportError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        serde_json::from_slice(bytes).map_err(TransportError::Decode)
    }
}
