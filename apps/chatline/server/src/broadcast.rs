//! Event stream for dashboards: session status and pairing codes over WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chatline_core::{GatewayEvent, SessionSupervisor};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stopped;

pub struct ObserverState {
    pub supervisor: SessionSupervisor,
    pub api_base_url: String,
    /// Flips to true when the gateway shuts down; attached observers are closed.
    pub stop: watch::Receiver<bool>,
}

pub fn build_observer_router(state: Arc<ObserverState>) -> Router {
    Router::new()
        .route("/", get(observer_handler))
        .route("/ws", get(observer_handler))
        .with_state(state)
}

pub fn hello_frame(observer_id: Uuid, connected_at: DateTime<Utc>, api_base_url: &str) -> Value {
    json!({
        "type": "hello",
        "payload": {
            "id": observer_id,
            "connectedAt": connected_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "apiBaseUrl": api_base_url,
        }
    })
}

async fn observer_handler(
    State(state): State<Arc<ObserverState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(socket, state))
}

async fn observe(socket: WebSocket, state: Arc<ObserverState>) {
    let observer_id = Uuid::new_v4();
    // Subscribe before the snapshot so nothing in between is lost.
    let mut events = BroadcastStream::new(state.supervisor.subscribe());
    let (mut ws_tx, mut ws_rx) = socket.split();
    let stop = stopped(state.stop.clone());
    tokio::pin!(stop);

    increment_gauge!("chatline_observers_active", 1.0);
    info!(observer_id = %observer_id, "observer attached");

    let mut initial = vec![hello_frame(observer_id, Utc::now(), &state.api_base_url)];
    initial.extend(
        state
            .supervisor
            .list_sessions()
            .into_iter()
            .map(|status| GatewayEvent::Status(status).to_frame()),
    );

    let mut open = true;
    for frame in initial {
        if ws_tx.send(Message::Text(frame.to_string())).await.is_err() {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            _ = &mut stop => {
                debug!(observer_id = %observer_id, "gateway stopping; closing observer");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if ws_tx.send(Message::Text(event.to_frame().to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    counter!("chatline_observer_events_skipped_total", skipped);
                    warn!(observer_id = %observer_id, skipped, "observer lagging; events skipped");
                }
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(observer_id = %observer_id, error = %err, "observer socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    decrement_gauge!("chatline_observers_active", 1.0);
    info!(observer_id = %observer_id, "observer detached");
}
