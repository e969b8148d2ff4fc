//! Hand-off of inbound protocol messages to the external processing queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const INBOUND_JOB_NAME: &str = "wa-message";
pub const DEFAULT_INBOUND_QUEUE: &str = "CHAT_INBOUND";
pub const DEFAULT_INBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInboundJob {
    pub session_id: String,
    pub message: Value,
    pub received_at: DateTime<Utc>,
}

/// One queue entry as the downstream worker expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundJob {
    pub name: String,
    pub data: ChatInboundJob,
}

impl InboundJob {
    pub fn new(session_id: &str, message: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            name: INBOUND_JOB_NAME.to_string(),
            data: ChatInboundJob {
                session_id: session_id.to_string(),
                message,
                received_at,
            },
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend failed: {0}")]
    Backend(String),
    #[error("job encoding failed: {0}")]
    Encode(String),
}

#[async_trait]
pub trait InboundQueue: Send + Sync {
    async fn enqueue_batch(&self, jobs: Vec<InboundJob>) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;
}

struct PendingBatch {
    session_id: String,
    messages: Vec<Value>,
    received_at: DateTime<Utc>,
}

/// Bounded buffer in front of an [`InboundQueue`], drained by one worker task.
///
/// `ingest` never waits on the queue: when the buffer is full the batch is dropped.
#[derive(Clone)]
pub struct InboundRelay {
    sender: mpsc::Sender<PendingBatch>,
    queue: Arc<dyn InboundQueue>,
    buffered: Arc<AtomicUsize>,
}

impl InboundRelay {
    pub fn spawn(queue: Arc<dyn InboundQueue>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let buffered = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(drain(
            receiver,
            Arc::clone(&queue),
            Arc::clone(&buffered),
        ));
        (
            Self {
                sender,
                queue,
                buffered,
            },
            worker,
        )
    }

    /// Returns false when the batch was dropped.
    pub fn ingest(&self, session_id: &str, messages: Vec<Value>) -> bool {
        if messages.is_empty() {
            return true;
        }
        let count = messages.len();
        let batch = PendingBatch {
            session_id: session_id.to_string(),
            messages,
            received_at: Utc::now(),
        };
        self.buffered.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(batch) {
            Ok(()) => true,
            Err(err) => {
                self.buffered.fetch_sub(1, Ordering::SeqCst);
                let cause = match err {
                    mpsc::error::TrySendError::Full(_) => "buffer_full",
                    mpsc::error::TrySendError::Closed(_) => "relay_closed",
                };
                counter!(
                    "chatline_inbound_dropped_total",
                    count as u64,
                    "cause" => cause
                );
                warn!(
                    session_id = %session_id,
                    messages = count,
                    cause,
                    "dropping inbound batch"
                );
                false
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Downstream queue depth plus batches not yet handed over.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let downstream = self.queue.depth().await?;
        Ok(downstream + self.buffered() as u64)
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<PendingBatch>,
    queue: Arc<dyn InboundQueue>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(batch) = receiver.recv().await {
        let session_id = batch.session_id;
        let jobs: Vec<InboundJob> = batch
            .messages
            .into_iter()
            .map(|message| InboundJob::new(&session_id, message, batch.received_at))
            .collect();
        let count = jobs.len() as u64;
        let result = queue.enqueue_batch(jobs).await;
        buffered.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(()) => {
                counter!("chatline_inbound_enqueued_total", count);
                debug!(session_id = %session_id, messages = count, "inbound batch enqueued");
            }
            Err(err) => {
                counter!(
                    "chatline_inbound_dropped_total",
                    count,
                    "cause" => "enqueue_failed"
                );
                warn!(session_id = %session_id, error = %err, "failed to enqueue inbound batch");
            }
        }
    }
    debug!("inbound relay drained");
}

/// Queue kept in process memory; used for development runs without Redis.
#[derive(Debug, Default)]
pub struct MemoryInboundQueue {
    jobs: Mutex<Vec<InboundJob>>,
}

impl MemoryInboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<InboundJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl InboundQueue for MemoryInboundQueue {
    async fn enqueue_batch(&self, jobs: Vec<InboundJob>) -> Result<(), QueueError> {
        self.jobs.lock().extend(jobs);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.jobs.lock().len() as u64)
    }
}
