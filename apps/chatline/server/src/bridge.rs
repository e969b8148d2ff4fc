//! WebSocket client for the protocol bridge sidecar.
//!
//! One socket per session at `<bridge_url>/sessions/<id>`. The gateway opens with an
//! `auth` frame carrying the stored credentials; the bridge answers with
//! `connection.update`, `creds.update` and `messages.upsert` frames. Outbound sends are
//! `send` frames correlated to their `send.result` by id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chatline_core::protocol::{
    ConnectionUpdate, ProtocolConnection, ProtocolConnector, ProtocolEvent, ProtocolLink,
    TransportError,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use uuid::Uuid;

const OUTBOUND_BUFFER: usize = 64;
const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeFrame {
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        session_id: String,
        credentials: Option<Value>,
    },
    #[serde(rename = "connection.update")]
    ConnectionUpdate(ConnectionUpdate),
    #[serde(rename = "creds.update")]
    CredsUpdate { credentials: Value },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert { messages: Vec<Value> },
    #[serde(rename = "send")]
    Send { id: Uuid, jid: String, content: Value },
    #[serde(rename = "send.result")]
    SendResult {
        id: Uuid,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

impl BridgeFrame {
    fn into_event(self) -> Option<ProtocolEvent> {
        match self {
            BridgeFrame::ConnectionUpdate(update) => Some(ProtocolEvent::Connection(update)),
            BridgeFrame::CredsUpdate { credentials } => Some(ProtocolEvent::Credentials(credentials)),
            BridgeFrame::MessagesUpsert { messages } => Some(ProtocolEvent::Messages(messages)),
            _ => None,
        }
    }
}

enum Outbound {
    Frame(String),
    Close,
}

type PendingSends = DashMap<Uuid, oneshot::Sender<Result<(), TransportError>>>;

#[derive(Debug, Clone)]
pub struct BridgeConnector {
    base_url: String,
    event_buffer: usize,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/sessions/{}",
            self.base_url.trim_end_matches('/'),
            session_id
        )
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<Value>,
    ) -> Result<ProtocolLink, TransportError> {
        let url = self.session_url(session_id);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let auth = encode(&BridgeFrame::Auth {
            session_id: session_id.to_string(),
            credentials,
        })?;
        sink.send(Message::text(auth))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(session_id = %session_id, url = %url, "bridge socket open");

        let (outbound, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
        let (events_tx, events) = mpsc::channel(self.event_buffer);
        let pending: Arc<PendingSends> = Arc::new(DashMap::new());

        let writer_session = session_id.to_string();
        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(payload) => {
                        if let Err(err) = sink.send(Message::text(payload)).await {
                            warn!(session_id = %writer_session, error = %err, "bridge write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader_session = session_id.to_string();
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => serde_json::from_str::<BridgeFrame>(text.as_str()),
                    Ok(Message::Binary(bytes)) => serde_json::from_slice::<BridgeFrame>(&bytes),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(session_id = %reader_session, error = %err, "bridge read failed");
                        break;
                    }
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(session_id = %reader_session, error = %err, "ignoring malformed bridge frame");
                        continue;
                    }
                };

                if let BridgeFrame::SendResult { id, ok, error } = frame {
                    if let Some((_, reply)) = reader_pending.remove(&id) {
                        let result = if ok {
                            Ok(())
                        } else {
                            Err(TransportError::Rejected(
                                error.unwrap_or_else(|| "send failed".to_string()),
                            ))
                        };
                        let _ = reply.send(result);
                    }
                    continue;
                }
                if let Some(event) = frame.into_event() {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            fail_pending(&reader_pending);
            debug!(session_id = %reader_session, "bridge socket closed");
        });

        let connection = BridgeConnection {
            outbound,
            pending,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok(ProtocolLink {
            connection: Arc::new(connection),
            events,
        })
    }
}

fn encode(frame: &BridgeFrame) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|err| TransportError::Rejected(err.to_string()))
}

fn fail_pending(pending: &PendingSends) {
    let ids: Vec<Uuid> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, reply)) = pending.remove(&id) {
            let _ = reply.send(Err(TransportError::Closed));
        }
    }
}

struct BridgeConnection {
    outbound: mpsc::Sender<Outbound>,
    pending: Arc<PendingSends>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl ProtocolConnection for BridgeConnection {
    async fn send_message(&self, target: &str, content: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = Uuid::new_v4();
        let payload = encode(&BridgeFrame::Send {
            id,
            jid: target.to_string(),
            content,
        })?;

        let (reply, result) = oneshot::channel();
        self.pending.insert(id, reply);
        if self.outbound.send(Outbound::Frame(payload)).await.is_err() {
            self.pending.remove(&id);
            return Err(TransportError::Closed);
        }
        result.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.try_send(Outbound::Close);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        let writer = tasks.next();
        let reader = tasks.next();
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        fail_pending(&self.pending);
    }
}
