use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::ConnectionState;

/// Externally visible snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub connection: ConnectionState,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Events fanned out to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Status(SessionStatus),
    /// A fresh pairing code; the payload carries it in `qr`.
    Qr(SessionStatus),
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::Status(_) => "status",
            GatewayEvent::Qr(_) => "qr",
        }
    }

    pub fn status(&self) -> &SessionStatus {
        match self {
            GatewayEvent::Status(status) | GatewayEvent::Qr(status) => status,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.status().session_id
    }

    /// `{type, payload}` frame as sent to observers.
    pub fn to_frame(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind(),
            "payload": self.status(),
        })
    }
}
