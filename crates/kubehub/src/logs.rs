//! Pod log relay: split a byte stream into lines and hand them to a sink.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use rollcheck_core::AccessError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Annotation naming the container `kubectl logs` picks by default.
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Receiver of relayed pod log lines.
pub trait LogSink: Send + Sync {
    /// Called once when the follow stream for `pod` has opened.
    fn attached(&self, _pod: &str) {}

    fn line(&self, pod: &str, line: &str);
}

/// Process-wide sink: every line becomes an info record on the `rollcheck::pod_log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, pod: &str, line: &str) {
        info!(target: "rollcheck::pod_log", pod = %pod, "{}", line);
    }
}

/// Container to request logs for. Single-container pods need none; for
/// multi-container pods use the default-container annotation, else the first container.
pub fn default_container(pod: &Pod) -> Option<String> {
    if let Some(c) = pod.metadata.annotations.as_ref().and_then(|a| a.get(DEFAULT_CONTAINER_ANNOTATION)) {
        return Some(c.clone());
    }
    let containers = &pod.spec.as_ref()?.containers;
    if containers.len() > 1 {
        containers.first().map(|c| c.name.clone())
    } else {
        None
    }
}

/// Consume a stream of bytes, split into lines, forward each to `sink`.
/// A trailing partial line is flushed when the stream ends or is cancelled.
pub async fn relay_lines<S, E>(stream: S, pod: &str, sink: &dyn LogSink, cancel: &CancellationToken) -> Result<(), AccessError>
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pod = %pod, "log relay cancelled");
                break Err(AccessError::Cancelled);
            }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            emit(sink, pod, &line);
                        }
                    }
                    Some(Err(e)) => break Err(AccessError::transport("pod log stream", e)),
                    None => break Ok(()),
                }
            }
        }
    };
    if !buf.is_empty() {
        emit(sink, pod, &buf);
    }
    debug!(pod = %pod, ok = result.is_ok(), "log relay ended");
    result
}

fn emit(sink: &dyn LogSink, pod: &str, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    sink.line(pod, text.strip_suffix('\r').unwrap_or(&text));
}
