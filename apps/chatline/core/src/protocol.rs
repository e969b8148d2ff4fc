//! Seams to the underlying chat protocol client.
//!
//! The gateway never speaks the protocol itself. A [`ProtocolConnector`] opens one
//! [`ProtocolLink`] per session: a shared handle for outbound sends plus an ordered
//! stream of [`ProtocolEvent`]s that the session actor consumes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    #[serde(rename = "close")]
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "close",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close codes reported by the protocol when a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Unavailable,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            403 => DisconnectReason::Forbidden,
            408 => DisconnectReason::ConnectionLost,
            411 => DisconnectReason::MultideviceMismatch,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            503 => DisconnectReason::Unavailable,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::BadSession => 500,
            DisconnectReason::Unavailable => 503,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::Other(code) => *code,
        }
    }

    /// Stored credentials can no longer be used; reconnecting would not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::LoggedOut
                | DisconnectReason::BadSession
                | DisconnectReason::ConnectionReplaced
        )
    }
}

/// Classification of a close event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Fatal(DisconnectReason),
    Transient(Option<DisconnectReason>),
}

impl CloseKind {
    pub fn classify(code: Option<u16>) -> Self {
        match code.map(DisconnectReason::from_code) {
            Some(reason) if reason.is_fatal() => CloseKind::Fatal(reason),
            other => CloseKind::Transient(other),
        }
    }
}

/// Connection-level update emitted by the protocol client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionState>,
    #[serde(default)]
    pub qr: Option<String>,
    /// Status code of the error that ended the connection, present on close.
    #[serde(default)]
    pub close_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Connection(ConnectionUpdate),
    /// The protocol rotated its credentials; they must be persisted before reuse.
    Credentials(Value),
    /// Raw inbound messages, forwarded untouched to the inbound queue.
    Messages(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("send rejected: {0}")]
    Rejected(String),
    #[error("send timed out")]
    TimedOut,
    #[error("connect failed: {0}")]
    Connect(String),
}

#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    async fn send_message(&self, target: &str, content: Value) -> Result<(), TransportError>;

    async fn close(&self);
}

pub struct ProtocolLink {
    pub connection: Arc<dyn ProtocolConnection>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<Value>,
    ) -> Result<ProtocolLink, TransportError>;
}
