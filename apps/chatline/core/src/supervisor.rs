use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::credentials::CredentialStore;
use crate::error::SendError;
use crate::events::{GatewayEvent, SessionStatus};
use crate::inbound::InboundRelay;
use crate::limiter::AtomicRateLimiter;
use crate::protocol::{
    CloseKind, ConnectionState, ConnectionUpdate, DisconnectReason, ProtocolConnector,
    TransportError,
};
use crate::session::{SessionCommand, SessionConnection};

pub const REASON_RECONNECT_EXHAUSTED: &str = "reconnect_exhausted";

const DEFAULT_COMMAND_BUFFER: usize = 32;
const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failed attempts before the session is paused; 0 never gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts != 0 && failures > self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconnect: ReconnectPolicy,
    pub send_timeout: Duration,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            send_timeout: Duration::from_secs(30),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    connection: ConnectionState,
    paused: bool,
    last_qr: Option<String>,
    reason: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn connecting() -> Self {
        Self {
            connection: ConnectionState::Connecting,
            paused: false,
            last_qr: None,
            reason: None,
            last_seen_at: None,
        }
    }

    fn snapshot(&self, session_id: &str) -> SessionStatus {
        SessionStatus {
            session_id: session_id.to_string(),
            connection: self.connection,
            paused: self.paused,
            reason: self.reason.clone(),
            qr: self.last_qr.clone(),
            last_seen_at: self.last_seen_at,
        }
    }
}

/// What a connection update means for the session actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    Pending,
    Opened,
    Transient(Option<DisconnectReason>),
    Fatal(DisconnectReason),
}

/// Live handle to one session's actor.
pub struct SessionHandle {
    session_id: String,
    generation: u64,
    commands: mpsc::Sender<SessionCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Dispatches one message through the session's current protocol connection.
    pub async fn send(&self, target: &str, content: Value) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send {
                target: target.to_string(),
                content,
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }
}

/// Owns every session: records, live actors and the observer fan-out.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<SupervisorInner>,
}

pub(crate) struct SupervisorInner {
    records: DashMap<String, SessionRecord>,
    live: DashMap<String, Arc<SessionHandle>>,
    pub(crate) connector: Arc<dyn ProtocolConnector>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) relay: InboundRelay,
    pub(crate) config: SupervisorConfig,
    limiter: Arc<AtomicRateLimiter>,
    events: broadcast::Sender<GatewayEvent>,
    generations: AtomicU64,
}

impl SessionSupervisor {
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        credentials: Arc<dyn CredentialStore>,
        limiter: Arc<AtomicRateLimiter>,
        relay: InboundRelay,
        config: SupervisorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(SupervisorInner {
                records: DashMap::new(),
                live: DashMap::new(),
                connector,
                credentials,
                relay,
                config,
                limiter,
                events,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the live session, creating and connecting it when none is tracked.
    ///
    /// A paused session is un-paused by this call.
    pub fn ensure_session(&self, session_id: &str) -> Arc<SessionHandle> {
        let (handle, receiver) = match self.inner.live.entry(session_id.to_string()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let (commands, receiver) =
                    mpsc::channel(self.inner.config.command_buffer.max(1));
                let handle = Arc::new(SessionHandle {
                    session_id: session_id.to_string(),
                    generation: self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1,
                    commands,
                    task: Mutex::new(None),
                });
                entry.insert(Arc::clone(&handle));
                (handle, receiver)
            }
        };

        self.inner
            .records
            .insert(session_id.to_string(), SessionRecord::connecting());
        info!(session_id = %session_id, generation = handle.generation, "session starting");
        self.inner.emit_status(session_id);

        let actor = SessionConnection::new(
            Arc::clone(&self.inner),
            session_id.to_string(),
            handle.generation,
            receiver,
        );
        let task = tokio::spawn(actor.run());
        *handle.task.lock() = Some(task);
        handle
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.inner
            .records
            .get(session_id)
            .map(|record| record.paused)
            .unwrap_or(false)
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.inner.live.contains_key(session_id)
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        target: &str,
        content: Value,
    ) -> Result<(), SendError> {
        if self.is_paused(session_id) {
            counter!("chatline_send_failures_total", 1, "cause" => SendError::SessionPaused.metric_label());
            return Err(SendError::SessionPaused);
        }

        let handle = self.ensure_session(session_id);
        if let Err(err) = self.inner.limiter.consume(session_id, 1).await {
            let err = SendError::from(err);
            counter!("chatline_send_failures_total", 1, "cause" => err.metric_label());
            return Err(err);
        }

        let dispatched =
            tokio::time::timeout(self.inner.config.send_timeout, handle.send(target, content))
                .await
                .unwrap_or(Err(TransportError::TimedOut));
        match dispatched {
            Ok(()) => {
                counter!("chatline_messages_sent_total", 1, "session_id" => session_id.to_string());
                Ok(())
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "outbound send failed");
                let err = SendError::Transport(err);
                counter!("chatline_send_failures_total", 1, "cause" => err.metric_label());
                Err(err)
            }
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn session(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.snapshot(session_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    pub fn relay(&self) -> &InboundRelay {
        &self.inner.relay
    }

    /// Closes every live connection and waits for the actors to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = self
            .inner
            .live
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(sessions = handles.len(), "closing live sessions");

        for handle in &handles {
            let _ = handle.commands.send(SessionCommand::Shutdown).await;
        }
        for handle in handles {
            let task = handle.task.lock().take();
            if let Some(task) = task {
                if let Err(err) = task.await {
                    warn!(session_id = %handle.session_id, error = %err, "session task failed");
                }
            }
        }
    }
}

impl SupervisorInner {
    fn snapshot(&self, session_id: &str) -> Option<SessionStatus> {
        self.records
            .get(session_id)
            .map(|record| record.snapshot(session_id))
    }

    fn emit(&self, event: GatewayEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_status(&self, session_id: &str) {
        if let Some(status) = self.snapshot(session_id) {
            self.emit(GatewayEvent::Status(status));
        }
    }

    /// Applies one connection update from the actor owning `generation`.
    ///
    /// A fatal close drops the live handle while the record is still locked;
    /// the actor's own teardown runs afterwards.
    pub(crate) fn apply_update(
        &self,
        session_id: &str,
        generation: u64,
        update: &ConnectionUpdate,
    ) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::Pending;
        let issued_qr = {
            let mut record = self
                .records
                .entry(session_id.to_string())
                .or_insert_with(SessionRecord::connecting);
            if let Some(qr) = &update.qr {
                record.last_qr = Some(qr.clone());
            }
            if let Some(state) = update.connection {
                record.connection = state;
                match state {
                    ConnectionState::Open => {
                        record.paused = false;
                        record.last_qr = None;
                        record.reason = None;
                        outcome = UpdateOutcome::Opened;
                    }
                    ConnectionState::Closed => match CloseKind::classify(update.close_code) {
                        CloseKind::Fatal(reason) => {
                            record.paused = true;
                            record.reason = Some(format!("disconnect:{}", reason.code()));
                            self.detach(session_id, generation);
                            outcome = UpdateOutcome::Fatal(reason);
                        }
                        CloseKind::Transient(reason) => {
                            record.reason = None;
                            outcome = UpdateOutcome::Transient(reason);
                        }
                    },
                    ConnectionState::Connecting => {}
                }
            }
            update.qr.is_some() && record.last_qr.is_some()
        };

        if issued_qr {
            counter!("chatline_qr_issued_total", 1);
            if let Some(status) = self.snapshot(session_id) {
                self.emit(GatewayEvent::Qr(status));
            }
        }

        match outcome {
            UpdateOutcome::Opened => info!(session_id = %session_id, "session open"),
            UpdateOutcome::Fatal(reason) => {
                counter!("chatline_sessions_paused_total", 1, "reason" => "disconnect");
                warn!(
                    session_id = %session_id,
                    status_code = reason.code(),
                    "session paused after fatal disconnect"
                );
            }
            UpdateOutcome::Transient(reason) => info!(
                session_id = %session_id,
                status_code = reason.map(|r| r.code()),
                "session closed"
            ),
            UpdateOutcome::Pending => {}
        }

        self.emit_status(session_id);
        outcome
    }

    pub(crate) fn mark_connecting(&self, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.connection = ConnectionState::Connecting;
        }
        self.emit_status(session_id);
    }

    pub(crate) fn mark_closed(&self, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.connection = ConnectionState::Closed;
        }
        self.emit_status(session_id);
    }

    /// Pauses a session that gave up on its own and drops its live handle.
    pub(crate) fn pause(&self, session_id: &str, generation: u64, reason: &str) {
        match self.records.get_mut(session_id) {
            Some(mut record) => {
                record.connection = ConnectionState::Closed;
                record.paused = true;
                record.reason = Some(reason.to_string());
                self.detach(session_id, generation);
            }
            None => self.detach(session_id, generation),
        }
        counter!("chatline_sessions_paused_total", 1, "reason" => reason.to_string());
        warn!(session_id = %session_id, reason, "session paused");
        self.emit_status(session_id);
    }

    /// Removes the live handle if it still belongs to `generation`.
    pub(crate) fn detach(&self, session_id: &str, generation: u64) {
        self.live
            .remove_if(session_id, |_, handle| handle.generation == generation);
    }

    pub(crate) fn touch(&self, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.last_seen_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::inbound::MemoryInboundQueue;
    use crate::limiter::{BucketConfig, Clock, ManualClock, MemoryScriptStore};
    use crate::protocol::ProtocolEvent;
    use crate::testing::{wait_until, FakeConnector};
    use serde_json::json;

    struct Harness {
        supervisor: SessionSupervisor,
        connector: Arc<FakeConnector>,
        store: Arc<MemoryScriptStore>,
        clock: Arc<ManualClock>,
        queue: Arc<MemoryInboundQueue>,
        credentials: Arc<MemoryCredentialStore>,
    }

    fn harness(config: SupervisorConfig) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let store = Arc::new(MemoryScriptStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = AtomicRateLimiter::new(store.clone(), BucketConfig::default())
            .with_clock(clock.clone());
        let queue = Arc::new(MemoryInboundQueue::new());
        let (relay, _worker) = InboundRelay::spawn(queue.clone(), 16);
        let credentials = Arc::new(MemoryCredentialStore::new());
        let supervisor = SessionSupervisor::new(
            connector.clone(),
            credentials.clone(),
            Arc::new(limiter),
            relay,
            config,
        );
        Harness {
            supervisor,
            connector,
            store,
            clock,
            queue,
            credentials,
        }
    }

    fn close(code: Option<u16>) -> ProtocolEvent {
        ProtocolEvent::Connection(ConnectionUpdate {
            connection: Some(ConnectionState::Closed),
            qr: None,
            close_code: code,
        })
    }

    fn open() -> ProtocolEvent {
        ProtocolEvent::Connection(ConnectionUpdate {
            connection: Some(ConnectionState::Open),
            ..ConnectionUpdate::default()
        })
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(500), Duration::from_secs(30));
        assert!(!policy.is_exhausted(10));
        assert!(policy.is_exhausted(11));
        let unlimited = ReconnectPolicy {
            max_attempts: 0,
            ..policy
        };
        assert!(!unlimited.is_exhausted(u32::MAX));
    }

    #[tokio::test]
    async fn ensure_session_creates_connecting_record_and_emits_status() {
        let h = harness(SupervisorConfig::default());
        let mut events = h.supervisor.subscribe();

        let handle = h.supervisor.ensure_session("branch-1");
        assert_eq!(handle.session_id(), "branch-1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "status");
        assert_eq!(event.status().connection, ConnectionState::Connecting);
        assert!(!event.status().paused);

        h.connector.link("branch-1", 0).await;
        assert_eq!(h.connector.connects("branch-1"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_session_creates_one_connection() {
        let h = harness(SupervisorConfig::default());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let supervisor = h.supervisor.clone();
                tokio::spawn(async move { supervisor.ensure_session("branch-1") })
            })
            .collect();
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        h.connector.link("branch-1", 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.connects("branch-1"), 1);
        assert_eq!(h.supervisor.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn send_goes_through_the_connection_and_consumes_a_token() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(open()).await;

        h.supervisor
            .send_message("branch-1", "5491100000000@s.whatsapp.net", json!({"text": "hola"}))
            .await
            .unwrap();

        assert_eq!(
            link.connection.sent(),
            vec![(
                "5491100000000@s.whatsapp.net".to_string(),
                json!({"text": "hola"})
            )]
        );
        let keys = h.supervisor.inner.limiter.keys_for("branch-1");
        assert_eq!(h.store.tokens(&keys, h.clock.now_millis()), Some(4.0));
    }

    #[tokio::test]
    async fn sixth_immediate_send_is_rate_limited() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(open()).await;

        for _ in 0..5 {
            h.supervisor
                .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
                .await
                .unwrap();
        }
        assert_eq!(
            h.supervisor
                .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
                .await,
            Err(SendError::RateLimitExceeded)
        );
        assert_eq!(link.connection.sent().len(), 5);

        h.clock.advance(Duration::from_secs(1));
        h.supervisor
            .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn paused_session_rejects_sends_without_touching_the_limiter() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(close(Some(401))).await;
        wait_until(|| h.supervisor.is_paused("branch-1")).await;

        let evaluations = h.store.evaluations();
        assert_eq!(
            h.supervisor
                .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
                .await,
            Err(SendError::SessionPaused)
        );
        assert_eq!(h.store.evaluations(), evaluations);
        assert_eq!(h.connector.connects("branch-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_close_pauses_and_never_reconnects() {
        let h = harness(SupervisorConfig::default());
        let mut events = h.supervisor.subscribe();
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;

        link.emit(close(Some(440))).await;
        wait_until(|| !h.supervisor.is_live("branch-1")).await;
        wait_until(|| link.connection.is_closed()).await;

        let status = h.supervisor.session("branch-1").unwrap();
        assert!(status.paused);
        assert_eq!(status.connection, ConnectionState::Closed);
        assert_eq!(status.reason.as_deref(), Some("disconnect:440"));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last.unwrap().status().reason.as_deref(),
            Some("disconnect:440")
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.connects("branch-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_close_reconnects_with_the_same_id_after_backoff() {
        let h = harness(SupervisorConfig::default());
        let first = h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(open()).await;
        link.emit(close(Some(428))).await;

        let second = h.connector.link("branch-1", 1).await;
        assert_eq!(h.connector.connects("branch-1"), 2);
        assert!(link.connection.is_closed());
        assert!(!h.supervisor.is_paused("branch-1"));
        // Same live handle: the actor reconnects in place.
        assert!(Arc::ptr_eq(&first, &h.supervisor.ensure_session("branch-1")));

        second.emit(open()).await;
        wait_until(|| {
            h.supervisor
                .session("branch-1")
                .map(|s| s.connection == ConnectionState::Open)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_backoff() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        let started = tokio::time::Instant::now();
        link.emit(close(None)).await;

        h.connector.link("branch-1", 1).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_pause_with_reconnect_exhausted() {
        let config = SupervisorConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                ..ReconnectPolicy::default()
            },
            ..SupervisorConfig::default()
        };
        let h = harness(config);
        h.connector.fail_next_connects(100);
        h.supervisor.ensure_session("branch-1");

        wait_until(|| h.supervisor.is_paused("branch-1")).await;
        let status = h.supervisor.session("branch-1").unwrap();
        assert_eq!(status.reason.as_deref(), Some(REASON_RECONNECT_EXHAUSTED));
        assert!(!h.supervisor.is_live("branch-1"));
        // Initial attempt plus three reconnects.
        assert_eq!(h.connector.connects("branch-1"), 4);
    }

    #[tokio::test]
    async fn explicit_connect_unpauses_a_paused_session() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(close(Some(500))).await;
        wait_until(|| !h.supervisor.is_live("branch-1")).await;
        assert!(h.supervisor.is_paused("branch-1"));

        h.supervisor.ensure_session("branch-1");
        assert!(!h.supervisor.is_paused("branch-1"));
        let status = h.supervisor.session("branch-1").unwrap();
        assert_eq!(status.connection, ConnectionState::Connecting);
        assert_eq!(status.reason, None);
        h.connector.link("branch-1", 1).await;
    }

    #[tokio::test]
    async fn connect_while_fatal_close_is_still_tearing_down_restarts_session() {
        let h = harness(SupervisorConfig::default());
        let first = h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.connection.hold_close();

        link.emit(close(Some(401))).await;
        wait_until(|| h.supervisor.is_paused("branch-1")).await;
        assert!(!h.supervisor.is_live("branch-1"));
        assert!(!link.connection.is_closed());

        let second = h.supervisor.ensure_session("branch-1");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!h.supervisor.is_paused("branch-1"));

        link.connection.release_close();
        wait_until(|| link.connection.is_closed()).await;
        let relinked = h.connector.link("branch-1", 1).await;
        relinked.emit(open()).await;
        wait_until(|| {
            h.supervisor
                .session("branch-1")
                .map(|s| s.connection == ConnectionState::Open)
                .unwrap_or(false)
        })
        .await;
        assert!(!h.supervisor.is_paused("branch-1"));
        assert!(h.supervisor.is_live("branch-1"));
        assert_eq!(h.connector.connects("branch-1"), 2);
    }

    #[tokio::test]
    async fn qr_is_emitted_and_cleared_once_open() {
        let h = harness(SupervisorConfig::default());
        let mut events = h.supervisor.subscribe();
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;

        link.emit(ProtocolEvent::Connection(ConnectionUpdate {
            qr: Some("2@pairing".into()),
            ..ConnectionUpdate::default()
        }))
        .await;
        wait_until(|| {
            h.supervisor
                .session("branch-1")
                .and_then(|s| s.qr)
                .is_some()
        })
        .await;

        let kinds: Vec<(&'static str, Option<String>)> = std::iter::from_fn(|| {
            events
                .try_recv()
                .ok()
                .map(|event| (event.kind(), event.status().qr.clone()))
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                ("status", None),
                ("qr", Some("2@pairing".to_string())),
                ("status", Some("2@pairing".to_string())),
            ]
        );

        link.emit(open()).await;
        wait_until(|| {
            h.supervisor
                .session("branch-1")
                .map(|s| s.connection == ConnectionState::Open && s.qr.is_none())
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn credentials_and_inbound_messages_are_handled() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;

        link.emit(ProtocolEvent::Credentials(json!({"noiseKey": "k1"})))
            .await;
        link.emit(ProtocolEvent::Messages(vec![json!({"key": {"id": "m1"}})]))
            .await;

        wait_until(|| h.queue.jobs().len() == 1).await;
        assert_eq!(h.credentials.get("branch-1"), Some(json!({"noiseKey": "k1"})));
        assert!(h.supervisor.session("branch-1").unwrap().last_seen_at.is_some());
        assert_eq!(h.queue.jobs()[0].data.session_id, "branch-1");
    }

    #[tokio::test]
    async fn stored_credentials_are_used_on_connect() {
        let h = harness(SupervisorConfig::default());
        h.credentials
            .save("branch-1", &json!({"me": "stored"}))
            .await
            .unwrap();
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        assert_eq!(link.credentials, Some(json!({"me": "stored"})));
    }

    #[tokio::test]
    async fn transport_failures_propagate_unchanged() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.connection
            .fail_sends_with(TransportError::Rejected("not on whatsapp".into()));

        assert_eq!(
            h.supervisor
                .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
                .await,
            Err(SendError::Transport(TransportError::Rejected(
                "not on whatsapp".into()
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out() {
        let h = harness(SupervisorConfig {
            send_timeout: Duration::from_secs(5),
            ..SupervisorConfig::default()
        });
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.connection.hang_sends();

        assert_eq!(
            h.supervisor
                .send_message("branch-1", "a@s.whatsapp.net", json!({"text": "x"}))
                .await,
            Err(SendError::Transport(TransportError::TimedOut))
        );
    }

    #[tokio::test]
    async fn list_sessions_is_sorted_and_side_effect_free() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("b");
        h.supervisor.ensure_session("a");
        let ids: Vec<String> = h
            .supervisor
            .list_sessions()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(h.supervisor.list_sessions().len(), 2);
        assert!(h.supervisor.session("c").is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_keeps_records() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.ensure_session("branch-1");
        let link = h.connector.link("branch-1", 0).await;
        link.emit(open()).await;

        h.supervisor.shutdown().await;

        assert!(link.connection.is_closed());
        assert!(!h.supervisor.is_live("branch-1"));
        let status = h.supervisor.session("branch-1").unwrap();
        assert_eq!(status.connection, ConnectionState::Closed);
        assert!(!status.paused);
    }
}
