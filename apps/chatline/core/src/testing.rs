//! Scriptable protocol doubles shared by the supervisor tests.

use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::protocol::{
    ProtocolConnection, ProtocolConnector, ProtocolEvent, ProtocolLink, TransportError,
};

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
pub struct FakeConnection {
    sent: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
    failure: Mutex<Option<TransportError>>,
    hang: AtomicBool,
    hold_close: AtomicBool,
    close_gate: Notify,
}

impl FakeConnection {
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends_with(&self, err: TransportError) {
        *self.failure.lock() = Some(err);
    }

    pub fn hang_sends(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Makes `close` wait until `release_close` is called.
    pub fn hold_close(&self) {
        self.hold_close.store(true, Ordering::SeqCst);
    }

    pub fn release_close(&self) {
        self.close_gate.notify_one();
    }
}

#[async_trait]
impl ProtocolConnection for FakeConnection {
    async fn send_message(&self, target: &str, content: Value) -> Result<(), TransportError> {
        if self.hang.load(Ordering::SeqCst) {
            pending::<()>().await;
        }
        let failure = self.failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.sent.lock().push((target.to_string(), content));
        Ok(())
    }

    async fn close(&self) {
        if self.hold_close.load(Ordering::SeqCst) {
            self.close_gate.notified().await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One accepted connect, as seen from the protocol side.
#[derive(Clone)]
pub struct FakeLink {
    pub connection: Arc<FakeConnection>,
    pub credentials: Option<Value>,
    events: mpsc::Sender<ProtocolEvent>,
}

impl FakeLink {
    pub async fn emit(&self, event: ProtocolEvent) {
        // The actor may already have dropped the link.
        let _ = self.events.send(event).await;
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<HashMap<String, Vec<FakeLink>>>,
    attempts: Mutex<HashMap<String, usize>>,
    failing: AtomicUsize,
}

impl FakeConnector {
    pub fn fail_next_connects(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }

    /// Connect attempts for a session, failed ones included.
    pub fn connects(&self, session_id: &str) -> usize {
        self.attempts.lock().get(session_id).copied().unwrap_or(0)
    }

    /// Waits for the `index`-th successful connect of a session.
    pub async fn link(&self, session_id: &str, index: usize) -> FakeLink {
        for _ in 0..5_000 {
            let found = self
                .links
                .lock()
                .get(session_id)
                .and_then(|links| links.get(index).cloned());
            if let Some(link) = found {
                return link;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no connect #{index} for {session_id}");
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<Value>,
    ) -> Result<ProtocolLink, TransportError> {
        *self
            .attempts
            .lock()
            .entry(session_id.to_string())
            .or_default() += 1;

        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("bridge unreachable".into()));
        }

        let (events, receiver) = mpsc::channel(64);
        let connection = Arc::new(FakeConnection::default());
        self.links
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(FakeLink {
                connection: Arc::clone(&connection),
                credentials,
                events,
            });
        Ok(ProtocolLink {
            connection,
            events: receiver,
        })
    }
}
