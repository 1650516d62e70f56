//! rollcheck core types: reason strings, detected problems, terminal outcomes
//! and the error taxonomy shared by the state accessor and the detector.

#![forbid(unsafe_code)]

pub mod owner;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason and type strings emitted by the orchestrator that the checks key on.
pub mod reasons {
    /// Deployment condition reason once `progressDeadlineSeconds` has elapsed.
    pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";
    /// Deployment condition reason when the replica set could not create pods (quota, admission).
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// Pod condition reason while at least one container is not ready.
    pub const CONTAINERS_NOT_READY: &str = "ContainersNotReady";
    /// Event reason for failed liveness/readiness probes.
    pub const UNHEALTHY: &str = "Unhealthy";
    pub const EVENT_TYPE_WARNING: &str = "Warning";
}

/// Annotation carrying the rollout revision on Deployments and their ReplicaSets.
pub const ANNOTATION_REVISION: &str = "deployment.kubernetes.io/revision";

/// Namespaced name of the tracked workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the state accessor. Detected rollout problems are not errors;
/// see [`Problem`].
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("transport: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("ambiguous_kind: {0}")]
    AmbiguousKind(String),
    #[error("cancelled")]
    Cancelled,
}

impl AccessError {
    pub fn transport(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport { context: context.into(), source: source.into() }
    }

    /// Errors after which there is nothing left to watch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::AmbiguousKind(_))
    }
}

/// Category of a rollout problem surfaced as a warning each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProblemKind {
    /// ReplicaSet creation failed (usually a resource quota).
    QuotaExceeded,
    PodNotReady,
    ContainerWaiting,
}

impl ProblemKind {
    /// Short machine-readable code for reporting.
    pub fn reason_code(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota-exceeded",
            Self::PodNotReady => "pod-not-ready",
            Self::ContainerWaiting => "container-waiting",
        }
    }
}

/// A rollout problem found by one diagnostic check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub kind: ProblemKind,
    pub message: String,
}

impl Problem {
    pub fn new(kind: ProblemKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProblemKind::QuotaExceeded => f.write_str(&self.message),
            ProblemKind::PodNotReady => write!(f, "Pod is not ready: {}", self.message),
            ProblemKind::ContainerWaiting => write!(f, "Waiting container: {}", self.message),
        }
    }
}

/// Terminal result of watching a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Converged,
    TimedOut,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Converged)
    }
}

pub mod prelude {
    pub use super::{AccessError, Outcome, Problem, ProblemKind, WorkloadId};
}
