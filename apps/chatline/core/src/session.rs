//! Per-session actor: the only owner of a session's protocol connection.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolEvent, ProtocolLink, TransportError};
use crate::supervisor::{SupervisorInner, UpdateOutcome, REASON_RECONNECT_EXHAUSTED};

pub(crate) enum SessionCommand {
    Send {
        target: String,
        content: Value,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// How one protocol link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkExit {
    Transient { opened: bool },
    Fatal,
    Shutdown,
}

pub(crate) struct SessionConnection {
    inner: Arc<SupervisorInner>,
    session_id: String,
    generation: u64,
    commands: mpsc::Receiver<SessionCommand>,
}

impl SessionConnection {
    pub(crate) fn new(
        inner: Arc<SupervisorInner>,
        session_id: String,
        generation: u64,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        Self {
            inner,
            session_id,
            generation,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let policy = self.inner.config.reconnect;
        let mut failures: u32 = 0;

        loop {
            let exit = match self.open_link().await {
                Ok(link) => self.drive(link).await,
                Err(err) => {
                    warn!(session_id = %self.session_id, error = %err, "connect attempt failed");
                    LinkExit::Transient { opened: false }
                }
            };

            match exit {
                LinkExit::Fatal => {
                    self.inner.detach(&self.session_id, self.generation);
                    return;
                }
                LinkExit::Shutdown => {
                    self.inner.detach(&self.session_id, self.generation);
                    self.inner.mark_closed(&self.session_id);
                    info!(session_id = %self.session_id, "session closed for shutdown");
                    return;
                }
                LinkExit::Transient { opened } => {
                    if opened {
                        failures = 0;
                    }
                    failures += 1;
                    if policy.is_exhausted(failures) {
                        self.inner.pause(
                            &self.session_id,
                            self.generation,
                            REASON_RECONNECT_EXHAUSTED,
                        );
                        return;
                    }

                    let delay = policy.delay_for(failures);
                    counter!("chatline_reconnect_attempts_total", 1);
                    info!(
                        session_id = %self.session_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting session"
                    );
                    if !self.back_off(delay).await {
                        self.inner.detach(&self.session_id, self.generation);
                        self.inner.mark_closed(&self.session_id);
                        return;
                    }
                    self.inner.mark_connecting(&self.session_id);
                }
            }
        }
    }

    async fn open_link(&self) -> Result<ProtocolLink, TransportError> {
        let credentials = match self.inner.credentials.load(&self.session_id).await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "failed to load credentials; pairing from scratch"
                );
                None
            }
        };
        self.inner
            .connector
            .connect(&self.session_id, credentials)
            .await
    }

    /// Consumes protocol events and commands until the link ends.
    async fn drive(&mut self, link: ProtocolLink) -> LinkExit {
        let ProtocolLink {
            connection,
            mut events,
        } = link;
        let mut opened = false;

        let exit = loop {
            tokio::select! {
                event = events.recv() => match event {
                    None => {
                        debug!(session_id = %self.session_id, "protocol event stream ended");
                        break LinkExit::Transient { opened };
                    }
                    Some(ProtocolEvent::Connection(update)) => {
                        match self.inner.apply_update(&self.session_id, self.generation, &update) {
                            UpdateOutcome::Pending => {}
                            UpdateOutcome::Opened => opened = true,
                            UpdateOutcome::Transient(_) => break LinkExit::Transient { opened },
                            UpdateOutcome::Fatal(_) => break LinkExit::Fatal,
                        }
                    }
                    Some(ProtocolEvent::Credentials(credentials)) => {
                        if let Err(err) = self
                            .inner
                            .credentials
                            .save(&self.session_id, &credentials)
                            .await
                        {
                            warn!(session_id = %self.session_id, error = %err, "failed to persist credentials");
                        }
                    }
                    Some(ProtocolEvent::Messages(messages)) => {
                        self.inner.touch(&self.session_id);
                        self.inner.relay.ingest(&self.session_id, messages);
                    }
                },
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break LinkExit::Shutdown,
                    Some(SessionCommand::Send { target, content, reply }) => {
                        let connection = Arc::clone(&connection);
                        tokio::spawn(async move {
                            let result = connection.send_message(&target, content).await;
                            let _ = reply.send(result);
                        });
                    }
                },
            }
        };

        connection.close().await;
        exit
    }

    /// Waits out a reconnect delay. Returns false when asked to stop meanwhile.
    async fn back_off(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => return false,
                    Some(SessionCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(TransportError::NotConnected));
                    }
                },
            }
        }
    }
}
