//! Per-job event channel and the frame stream the SSE endpoint serializes.
//!
//! A job owns exactly one [`EventChannel`]. The worker (and the cancel
//! endpoint, for `job_stopping`) push into it; stream readers pop from it in
//! FIFO order. Readers share one receiver, so concurrent readers split the
//! backlog between them rather than each seeing every event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::job::Job;

/// How long a stream reader waits for the next event before sending a
/// keep-alive comment.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    RenderStart,
    Log,
    RenderDone,
    Image,
    JobDone,
    JobError,
    JobCancelled,
    JobStopping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobStarted => "job_started",
            EventKind::RenderStart => "render_start",
            EventKind::Log => "log",
            EventKind::RenderDone => "render_done",
            EventKind::Image => "image",
            EventKind::JobDone => "job_done",
            EventKind::JobError => "job_error",
            EventKind::JobCancelled => "job_cancelled",
            EventKind::JobStopping => "job_stopping",
        }
    }

    /// Whether this kind ends a job: exactly one of these is the last
    /// worker-emitted event of every job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::JobDone | EventKind::JobError | EventKind::JobCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    #[serde(with = "ts_seconds_float")]
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Event {
            kind,
            payload,
            ts: Utc::now(),
        }
    }
}

mod ts_seconds_float {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(ts.timestamp_micros() as f64 / 1_000_000.0)
    }
}

/// Unbounded FIFO queue of [`Event`]s.
///
/// `put` never blocks, so a slow or absent reader cannot stall the worker.
#[derive(Debug)]
pub struct EventChannel {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventChannel {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn put(&self, event: Event) {
        // The receiver lives as long as the channel itself, so this cannot fail.
        let _ = self.tx.send(event);
    }

    /// Waits up to `timeout` for the next event.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub async fn is_empty(&self) -> bool {
        self.rx.lock().await.is_empty()
    }
}

/// One unit written to an event stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Handshake sent once when the stream opens.
    Hello { job_id: String },
    Event(Event),
    KeepAlive,
}

impl Frame {
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Frame::Hello { .. } => Some("hello"),
            Frame::Event(event) => Some(event.kind.as_str()),
            Frame::KeepAlive => None,
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            Frame::Hello { job_id } => Some(serde_json::json!({ "job_id": job_id })),
            Frame::Event(event) => Some(event.payload.clone()),
            Frame::KeepAlive => None,
        }
    }
}

enum StreamState {
    Opening(Arc<Job>),
    Open(Arc<Job>),
}

/// Frames for one reader of `job`'s channel: a hello, then every event as it
/// arrives, with a keep-alive after each idle `poll`. Ends once the job is
/// done and its backlog has been drained.
pub fn frames(job: Arc<Job>, poll: Duration) -> impl Stream<Item = Frame> {
    stream::unfold(Some(StreamState::Opening(job)), move |state| async move {
        match state? {
            StreamState::Opening(job) => {
                let hello = Frame::Hello {
                    job_id: job.id().to_string(),
                };
                Some((hello, Some(StreamState::Open(job))))
            }
            StreamState::Open(job) => {
                // Read `done` before checking emptiness: the worker enqueues its
                // last event before publishing `done`.
                if job.is_done() && job.events().is_empty().await {
                    return None;
                }
                let frame = match job.events().recv_timeout(poll).await {
                    Some(event) => Frame::Event(event),
                    None => Frame::KeepAlive,
                };
                Some((frame, Some(StreamState::Open(job))))
            }
        }
    })
}
