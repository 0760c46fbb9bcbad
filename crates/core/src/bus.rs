use crate::metrics::Metrics;
use crate::pipeline::ExitClass;
use crate::sessions::StopReason;
use crate::stream::StreamSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

pub const TOPIC_SESSION_START: &str = "session.start";
pub const TOPIC_SESSION_STOP: &str = "session.stop";
pub const TOPIC_SESSION_STARTED: &str = "session.started";
pub const TOPIC_SESSION_STOPPING: &str = "session.stopping";
pub const TOPIC_SESSION_ENDED: &str = "session.ended";
pub const TOPIC_SESSION_FAILED: &str = "session.failed";
pub const TOPIC_PIPELINE_EXITED: &str = "pipeline.exited";

/// Everything that travels over the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    StartSession {
        spec: Box<StreamSpec>,
        correlation_id: String,
        requested_at: i64,
    },
    StopSession {
        session_id: String,
        reason: StopReason,
        correlation_id: String,
        requested_at: i64,
    },
    SessionStarted {
        session_id: String,
        correlation_id: String,
    },
    SessionStopping {
        session_id: String,
        correlation_id: String,
    },
    SessionEnded {
        session_id: String,
        correlation_id: String,
        reason: StopReason,
    },
    SessionFailed {
        session_id: String,
        correlation_id: String,
        reason: String,
    },
    PipelineExited {
        session_id: String,
        handle: String,
        exit_code: Option<i32>,
        classification: ExitClass,
    },
}

/// One delivered message; `seq` is monotonic per topic
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub seq: u64,
    pub payload: EventPayload,
}

struct TopicState {
    seq: u64,
    subscribers: Vec<(u64, mpsc::Sender<Envelope>)>,
}

struct BusInner {
    topics: HashMap<String, TopicState>,
    next_sub_id: u64,
}

/// In-process publish/subscribe with bounded per-subscriber buffers.
///
/// Publishing never blocks: every subscriber gets a non-blocking offer and
/// a full buffer drops the message for that subscriber only, advancing the
/// topic's drop counter.
pub struct EventBus {
    inner: Mutex<BusInner>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                topics: HashMap::new(),
                next_sub_id: 1,
            }),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Offer `payload` to every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers whose buffer accepted the message.
    pub fn publish(&self, topic: &str, payload: EventPayload) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.topics.entry(topic.to_string()).or_insert(TopicState {
            seq: 0,
            subscribers: Vec::new(),
        });
        state.seq += 1;
        let envelope = Envelope {
            topic: topic.to_string(),
            seq: state.seq,
            payload,
        };

        let mut delivered = 0;
        state.subscribers.retain(|(id, tx)| {
            match tx.try_send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.bus_dropped.with_label_values(&[topic]).inc();
                    debug!(topic, subscriber = id, "dropped message on full buffer");
                    true
                }
                // Receiver is gone, forget the subscriber
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner
            .topics
            .entry(topic.to_string())
            .or_insert(TopicState {
                seq: 0,
                subscribers: Vec::new(),
            })
            .subscribers
            .push((id, tx));
        Subscription {
            topic: topic.to_string(),
            rx,
            closed: false,
        }
    }

    /// Live subscriber count for a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .topics
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}

/// A bounded mailbox on one topic. Dropping it (or calling `close`)
/// detaches from the bus; the next publish prunes the sender side.
pub struct Subscription {
    pub topic: String,
    rx: mpsc::Receiver<Envelope>,
    closed: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Idempotent: stop receiving and drain anything buffered
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
