//! In-process gateway wiring for handler tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatline_core::credentials::MemoryCredentialStore;
use chatline_core::inbound::{InboundRelay, MemoryInboundQueue};
use chatline_core::limiter::{AtomicRateLimiter, BucketConfig, MemoryScriptStore};
use chatline_core::protocol::{
    ConnectionState, ConnectionUpdate, ProtocolConnection, ProtocolConnector, ProtocolEvent,
    ProtocolLink, TransportError,
};
use chatline_core::{SessionSupervisor, SupervisorConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingConnection {
    sent: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ProtocolConnection for RecordingConnection {
    async fn send_message(&self, target: &str, content: Value) -> Result<(), TransportError> {
        self.sent.lock().push((target.to_string(), content));
        Ok(())
    }

    async fn close(&self) {}
}

/// Accepts every connect and keeps the event side so tests can drive sessions.
#[derive(Default)]
pub struct StubConnector {
    events: Mutex<HashMap<String, mpsc::Sender<ProtocolEvent>>>,
    connections: Mutex<HashMap<String, Arc<RecordingConnection>>>,
}

impl StubConnector {
    pub fn sent(&self, session_id: &str) -> Vec<(String, Value)> {
        self.connections
            .lock()
            .get(session_id)
            .map(|connection| connection.sent.lock().clone())
            .unwrap_or_default()
    }

    pub async fn emit(&self, session_id: &str, event: ProtocolEvent) {
        let mut sender = None;
        for _ in 0..500 {
            sender = self.events.lock().get(session_id).cloned();
            if sender.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    pub async fn close_with(&self, session_id: &str, code: u16) {
        self.emit(
            session_id,
            ProtocolEvent::Connection(ConnectionUpdate {
                connection: Some(ConnectionState::Closed),
                qr: None,
                close_code: Some(code),
            }),
        )
        .await;
    }
}

#[async_trait]
impl ProtocolConnector for StubConnector {
    async fn connect(
        &self,
        session_id: &str,
        _credentials: Option<Value>,
    ) -> Result<ProtocolLink, TransportError> {
        let (sender, events) = mpsc::channel(32);
        let connection = Arc::new(RecordingConnection::default());
        self.events.lock().insert(session_id.to_string(), sender);
        self.connections
            .lock()
            .insert(session_id.to_string(), Arc::clone(&connection));
        Ok(ProtocolLink { connection, events })
    }
}

pub struct Gateway {
    pub supervisor: SessionSupervisor,
    pub connector: Arc<StubConnector>,
    pub queue: Arc<MemoryInboundQueue>,
}

pub fn gateway(bucket: BucketConfig) -> Gateway {
    let connector = Arc::new(StubConnector::default());
    let limiter = AtomicRateLimiter::new(Arc::new(MemoryScriptStore::new()), bucket);
    let queue = Arc::new(MemoryInboundQueue::new());
    let (relay, _worker) = InboundRelay::spawn(queue.clone(), 16);
    let supervisor = SessionSupervisor::new(
        connector.clone(),
        Arc::new(MemoryCredentialStore::new()),
        Arc::new(limiter),
        relay,
        SupervisorConfig::default(),
    );
    Gateway {
        supervisor,
        connector,
        queue,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
