//! rollcheck detector: the diagnostic checks run against a Deployment each
//! poll cycle, and the driver loop that decides when the rollout is over.
//!
//! Checks are independent. Detected problems are returned as values
//! ([`Problem`]); only accessor failures are errors. The one stateful check is
//! [`ProblemDetector::stream_logs`], which keeps at most one follow log stream
//! per pod of the active generation and reopens streams that broke.

#![forbid(unsafe_code)]

mod driver;
mod streams;

pub use driver::{poll_once, watch, CycleReport, WatchConfig, DEFAULT_POLL_INTERVAL};
pub use streams::{StreamEvent, StreamReport};

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use rollcheck_core::{reasons, AccessError, Problem, ProblemKind};
use rollcheck_kubehub::{ClusterState, LogSink, TracingSink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use streams::{AttachSink, SharedBook};

/// Knobs for a detector instance.
#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
    /// Give up on a pod's logs after this many failed or broken streams. `None` retries every cycle.
    pub max_stream_attempts: Option<u32>,
}

pub struct ProblemDetector<S> {
    state: Arc<S>,
    config: DetectorConfig,
    sink: Arc<dyn LogSink>,
    book: SharedBook,
    tasks: TaskTracker,
    cancel: CancellationToken,
    reports_tx: mpsc::UnboundedSender<StreamReport>,
    reports_rx: mpsc::UnboundedReceiver<StreamReport>,
}

impl<S: ClusterState + 'static> ProblemDetector<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self::with_config(state, DetectorConfig::default())
    }

    pub fn with_config(state: Arc<S>, config: DetectorConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            state,
            config,
            sink: Arc::new(TracingSink),
            book: SharedBook::default(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            reports_tx,
            reports_rx,
        }
    }

    /// Relay pod log lines somewhere other than the tracing sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Log-stream tasks stop when `cancel` (or [`shutdown`](Self::shutdown)) fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Desired, current, available and updated replica counts are all equal.
    pub fn rollout_complete(&self, deployment: &Deployment) -> bool {
        // spec.replicas is defaulted to 1 by the API server
        let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = deployment.status.clone().unwrap_or_default();
        let current = status.replicas.unwrap_or(0);
        let available = status.available_replicas.unwrap_or(0);
        let updated = status.updated_replicas.unwrap_or(0);
        desired == current && desired == available && desired == updated
    }

    /// First `FailedCreate` condition, message verbatim.
    pub fn quota_problem(&self, deployment: &Deployment) -> Option<Problem> {
        deployment_conditions(deployment)
            .find(|c| c.reason.as_deref() == Some(reasons::FAILED_CREATE))
            .map(|c| Problem::new(ProblemKind::QuotaExceeded, c.message.clone().unwrap_or_default()))
    }

    /// First pod with a `ContainersNotReady` condition. The message is prefixed
    /// with the pod's `Unhealthy` warning event when there is one.
    pub async fn readiness_problem(
        &self,
        deployment: &Deployment,
        cancel: &CancellationToken,
    ) -> Result<Option<Problem>, AccessError> {
        let pods = self.state.owned_pods(deployment, cancel).await?;
        for pod in &pods {
            let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_ref());
            let Some(cond) = conditions
                .into_iter()
                .flatten()
                .find(|c| c.reason.as_deref() == Some(reasons::CONTAINERS_NOT_READY))
            else {
                continue;
            };
            let cond_message = cond.message.clone().unwrap_or_default();
            let events = self.state.events_for(&pod.metadata, cancel).await?;
            let unhealthy = events.iter().find(|ev| {
                ev.type_.as_deref() == Some(reasons::EVENT_TYPE_WARNING) && ev.reason.as_deref() == Some(reasons::UNHEALTHY)
            });
            let message = match unhealthy {
                Some(ev) => format!("{}: {}", ev.message.as_deref().unwrap_or_default(), cond_message),
                None => cond_message,
            };
            return Ok(Some(Problem::new(ProblemKind::PodNotReady, message)));
        }
        Ok(None)
    }

    /// First container that is not ready and sits in a waiting state.
    pub async fn containers_start_problems(
        &self,
        deployment: &Deployment,
        cancel: &CancellationToken,
    ) -> Result<Option<Problem>, AccessError> {
        let pods = self.state.owned_pods(deployment, cancel).await?;
        let waiting = pods
            .iter()
            .filter_map(|p| p.status.as_ref()?.container_statuses.as_ref())
            .flatten()
            .filter(|cs| !cs.ready)
            .find_map(|cs| cs.state.as_ref()?.waiting.as_ref());
        Ok(waiting.map(|w| {
            let message = format!(
                "{}: {}",
                w.reason.as_deref().unwrap_or_default(),
                w.message.as_deref().unwrap_or_default()
            );
            Problem::new(ProblemKind::ContainerWaiting, message)
        }))
    }

    /// A `ProgressDeadlineExceeded` condition is present.
    pub fn deploy_timeout(&self, deployment: &Deployment) -> bool {
        deployment_conditions(deployment).any(|c| c.reason.as_deref() == Some(reasons::PROGRESS_DEADLINE_EXCEEDED))
    }

    /// Spawn a log-stream task for every owned pod that is not attached,
    /// in flight or abandoned. Returns how many tasks were started.
    pub async fn stream_logs(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<usize, AccessError> {
        let pods = self.state.owned_pods(deployment, cancel).await?;
        let mut spawned = 0;
        for pod in pods {
            let Some(name) = pod.metadata.name.clone() else { continue };
            if !self.book.with(|b| b.claim(&name)) {
                continue;
            }
            self.spawn_stream(name, pod);
            spawned += 1;
        }
        Ok(spawned)
    }

    fn spawn_stream(&self, name: String, pod: Pod) {
        let state = Arc::clone(&self.state);
        let book = self.book.clone();
        let reports = self.reports_tx.clone();
        let max_attempts = self.config.max_stream_attempts;
        let cancel = self.cancel.child_token();
        let sink = AttachSink { book: book.clone(), inner: Arc::clone(&self.sink), reports: reports.clone() };
        debug!(pod = %name, "spawning log stream");
        self.tasks.spawn(async move {
            let result = state.stream_logs(&pod, &sink, &cancel).await;
            let event = match result {
                Ok(()) => {
                    book.with(|b| b.mark_attached(&name));
                    StreamEvent::Ended
                }
                Err(AccessError::Cancelled) => {
                    book.with(|b| b.release(&name));
                    StreamEvent::Cancelled
                }
                Err(e) => {
                    let (was_attached, attempts, abandoned) = book.with(|b| {
                        let was_attached = b.is_attached(&name);
                        let (attempts, abandoned) = b.mark_failed(&name, max_attempts);
                        (was_attached, attempts, abandoned)
                    });
                    let error = e.to_string();
                    if was_attached {
                        counter!("rollcheck_log_streams_total", "result" => "interrupted").increment(1);
                        StreamEvent::Interrupted { error, attempts, abandoned }
                    } else {
                        counter!("rollcheck_log_streams_total", "result" => "failed").increment(1);
                        StreamEvent::Failed { error, attempts, abandoned }
                    }
                }
            };
            let _ = reports.send(StreamReport { pod: name, event });
        });
    }

    /// Pod has an attached log stream.
    pub fn is_streamed(&self, pod: &str) -> bool {
        self.book.with(|b| b.is_attached(pod))
    }

    /// Pod's log stream hit the attempt limit and will not be retried.
    pub fn is_stream_abandoned(&self, pod: &str) -> bool {
        self.book.with(|b| b.is_abandoned(pod))
    }

    /// Reports produced by log-stream tasks since the last call.
    pub fn drain_stream_reports(&mut self) -> Vec<StreamReport> {
        let mut out = Vec::new();
        while let Ok(r) = self.reports_rx.try_recv() {
            out.push(r);
        }
        out
    }

    /// Wait for the next log-stream report.
    pub async fn next_stream_report(&mut self) -> Option<StreamReport> {
        self.reports_rx.recv().await
    }

    /// Cancel all log-stream tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn deployment_conditions(
    deployment: &Deployment,
) -> impl Iterator<Item = &k8s_openapi::api::apps::v1::DeploymentCondition> {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
}
