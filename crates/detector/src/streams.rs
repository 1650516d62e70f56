//! Bookkeeping for pod log streams: which pods are attached, which have an
//! attempt in flight, and how often opening failed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use rollcheck_kubehub::LogSink;
use tokio::sync::mpsc;

/// What happened to one log-stream task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The follow stream opened; the pod is not streamed again unless it breaks.
    Attached,
    /// The stream ended normally (pod terminated or log rotated away).
    Ended,
    /// The stream broke after it had attached; the pod is retried like a failed open.
    Interrupted { error: String, attempts: u32, abandoned: bool },
    /// Opening the stream failed. `abandoned` is set once the attempt limit is reached.
    Failed { error: String, attempts: u32, abandoned: bool },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub pod: String,
    pub event: StreamEvent,
}

#[derive(Debug, Default)]
pub(crate) struct StreamBook {
    attached: HashSet<String>,
    pending: HashSet<String>,
    abandoned: HashSet<String>,
    failures: HashMap<String, u32>,
}

impl StreamBook {
    /// Reserve `pod` for a new attempt. False if it is attached, in flight or abandoned.
    pub(crate) fn claim(&mut self, pod: &str) -> bool {
        if self.attached.contains(pod) || self.pending.contains(pod) || self.abandoned.contains(pod) {
            return false;
        }
        self.pending.insert(pod.to_string());
        true
    }

    pub(crate) fn mark_attached(&mut self, pod: &str) {
        self.pending.remove(pod);
        self.attached.insert(pod.to_string());
    }

    /// Record a failed attempt, either a failed open or a stream that broke
    /// after attaching. The pod becomes claimable again unless the limit is
    /// reached. Failures accumulate across attachments. Returns `(attempts, abandoned)`.
    pub(crate) fn mark_failed(&mut self, pod: &str, max_attempts: Option<u32>) -> (u32, bool) {
        self.pending.remove(pod);
        self.attached.remove(pod);
        let attempts = self.failures.entry(pod.to_string()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        let abandoned = max_attempts.is_some_and(|max| attempts >= max);
        if abandoned {
            self.abandoned.insert(pod.to_string());
        }
        (attempts, abandoned)
    }

    pub(crate) fn release(&mut self, pod: &str) {
        self.pending.remove(pod);
    }

    pub(crate) fn is_attached(&self, pod: &str) -> bool {
        self.attached.contains(pod)
    }

    pub(crate) fn is_abandoned(&self, pod: &str) -> bool {
        self.abandoned.contains(pod)
    }
}

/// Shared handle; every read-check-write happens under one lock acquisition.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBook(Arc<Mutex<StreamBook>>);

impl SharedBook {
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut StreamBook) -> R) -> R {
        let mut book = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut book)
    }
}

/// Sink handed to a streaming task: records attachment, then forwards lines.
pub(crate) struct AttachSink {
    pub(crate) book: SharedBook,
    pub(crate) inner: Arc<dyn LogSink>,
    pub(crate) reports: mpsc::UnboundedSender<StreamReport>,
}

impl LogSink for AttachSink {
    fn attached(&self, pod: &str) {
        self.book.with(|b| b.mark_attached(pod));
        counter!("rollcheck_log_streams_total", "result" => "attached").increment(1);
        let _ = self.reports.send(StreamReport { pod: pod.to_string(), event: StreamEvent::Attached });
        self.inner.attached(pod);
    }

    fn line(&self, pod: &str, line: &str) {
        self.inner.line(pod, line);
    }
}
