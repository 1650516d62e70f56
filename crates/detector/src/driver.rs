//! Polling driver: run the checks in a fixed order once per cycle and turn
//! the results into log records until the rollout converges or times out.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use metrics::counter;
use rollcheck_core::{AccessError, Outcome, Problem, WorkloadId};
use rollcheck_kubehub::ClusterState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ProblemDetector, StreamEvent, StreamReport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL }
    }
}

/// Everything one poll cycle found.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub problems: Vec<Problem>,
    /// Non-fatal accessor failures from individual checks.
    pub errors: Vec<AccessError>,
    pub spawned_streams: usize,
    pub outcome: Option<Outcome>,
}

impl CycleReport {
    /// Keep transport failures for reporting; fatal and cancellation errors end the cycle.
    fn absorb(&mut self, err: AccessError) -> Result<(), AccessError> {
        if err.is_fatal() || matches!(err, AccessError::Cancelled) {
            return Err(err);
        }
        self.errors.push(err);
        Ok(())
    }

    fn collect(&mut self, res: Result<Option<Problem>, AccessError>) -> Result<(), AccessError> {
        match res {
            Ok(Some(p)) => self.problems.push(p),
            Ok(None) => {}
            Err(e) => self.absorb(e)?,
        }
        Ok(())
    }
}

/// Run one cycle of checks against an already fetched deployment.
pub async fn poll_once<S: ClusterState + 'static>(
    detector: &ProblemDetector<S>,
    deployment: &Deployment,
    cancel: &CancellationToken,
) -> Result<CycleReport, AccessError> {
    let mut report = CycleReport::default();
    if detector.rollout_complete(deployment) {
        report.outcome = Some(Outcome::Converged);
        return Ok(report);
    }

    match detector.stream_logs(deployment, cancel).await {
        Ok(n) => report.spawned_streams = n,
        Err(e) => report.absorb(e)?,
    }
    if let Some(p) = detector.quota_problem(deployment) {
        report.problems.push(p);
    }
    report.collect(detector.containers_start_problems(deployment, cancel).await)?;
    report.collect(detector.readiness_problem(deployment, cancel).await)?;

    if detector.deploy_timeout(deployment) {
        report.outcome = Some(Outcome::TimedOut);
    }
    Ok(report)
}

/// Poll the deployment until it converges or its progress deadline is exceeded.
///
/// Failing to fetch the deployment ends the watch; per-check transport errors
/// are logged and polling continues.
pub async fn watch<S: ClusterState + 'static>(
    detector: &mut ProblemDetector<S>,
    id: &WorkloadId,
    config: &WatchConfig,
    cancel: &CancellationToken,
) -> Result<Outcome, AccessError> {
    info!(deployment = %id, interval_ms = config.poll_interval.as_millis() as u64, "tracking rollout");
    loop {
        let deployment = detector.state().get_workload(id, cancel).await?;
        let report = poll_once(&*detector, &deployment, cancel).await?;
        counter!("rollcheck_poll_cycles_total").increment(1);

        for r in detector.drain_stream_reports() {
            log_stream_report(&r);
        }
        for p in &report.problems {
            counter!("rollcheck_problems_total", "reason" => p.kind.reason_code()).increment(1);
            warn!(reason = p.kind.reason_code(), "{}", p);
        }
        for e in &report.errors {
            warn!(error = %e, "check failed");
        }
        debug!(problems = report.problems.len(), streams = report.spawned_streams, "poll cycle done");

        match report.outcome {
            Some(Outcome::Converged) => {
                info!(message_name = "buildStatus", "Deployment \"{}\" is successful", id.name);
                return Ok(Outcome::Converged);
            }
            Some(Outcome::TimedOut) => {
                error!(message_name = "buildProblem", fatal = true, "Deployment progress deadline exceeded");
                return Ok(Outcome::TimedOut);
            }
            None => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(AccessError::Cancelled),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}

fn log_stream_report(r: &StreamReport) {
    match &r.event {
        StreamEvent::Attached => info!(pod = %r.pod, "streaming pod logs"),
        StreamEvent::Ended => debug!(pod = %r.pod, "pod log stream ended"),
        StreamEvent::Interrupted { error, attempts, abandoned: false } => {
            warn!(pod = %r.pod, attempts, error = %error, "pod log stream interrupted; retrying next cycle")
        }
        StreamEvent::Interrupted { error, attempts, abandoned: true } => {
            warn!(pod = %r.pod, attempts, error = %error, "pod log stream interrupted; giving up")
        }
        StreamEvent::Failed { error, attempts, abandoned: false } => {
            warn!(pod = %r.pod, attempts, error = %error, "pod log stream failed; retrying next cycle")
        }
        StreamEvent::Failed { error, attempts, abandoned: true } => {
            warn!(pod = %r.pod, attempts, error = %error, "pod log stream failed; giving up")
        }
        StreamEvent::Cancelled => debug!(pod = %r.pod, "pod log stream cancelled"),
    }
}
