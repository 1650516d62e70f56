#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentSpec, DeploymentStatus, ReplicaSet};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, Event, ObjectReference, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use rollcheck_core::{owner, AccessError, WorkloadId, ANNOTATION_REVISION};
use rollcheck_kubehub::{ClusterState, LogSink};
use tokio_util::sync::CancellationToken;

pub const NS: &str = "ci";

/// How the fake answers a log-stream request for a pod.
#[derive(Debug, Clone)]
pub enum LogBehavior {
    /// Attach, emit the lines, end normally.
    Lines(Vec<String>),
    /// Fail before attaching.
    FailOpen,
    /// Attach, emit the lines, then fail with a transport error.
    Break(Vec<String>),
    /// Attach and follow until cancelled.
    Follow,
}

/// In-memory cluster. `get_workload` returns the front deployment and pops it
/// while more than one remains, so a queue scripts a rollout over cycles.
#[derive(Default)]
pub struct FakeCluster {
    pub deployments: Mutex<VecDeque<Deployment>>,
    pub replica_sets: Mutex<Vec<ReplicaSet>>,
    pub pods: Mutex<Vec<Pod>>,
    pub events: Mutex<Vec<Event>>,
    pub logs: Mutex<HashMap<String, LogBehavior>>,
    pub log_attempts: Mutex<HashMap<String, u32>>,
    pub fail_lists: AtomicBool,
}

impl FakeCluster {
    pub fn with_rollout(deployments: Vec<Deployment>, replica_sets: Vec<ReplicaSet>, pods: Vec<Pod>) -> Self {
        Self {
            deployments: Mutex::new(deployments.into()),
            replica_sets: Mutex::new(replica_sets),
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    pub fn set_logs(&self, pod: &str, behavior: LogBehavior) {
        self.logs.lock().unwrap().insert(pod.to_string(), behavior);
    }

    pub fn attempts(&self, pod: &str) -> u32 {
        self.log_attempts.lock().unwrap().get(pod).copied().unwrap_or(0)
    }

    fn check_lists(&self) -> Result<(), AccessError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(AccessError::transport("list_pods", "connection refused"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterState for FakeCluster {
    async fn get_workload(&self, id: &WorkloadId, cancel: &CancellationToken) -> Result<Deployment, AccessError> {
        if cancel.is_cancelled() {
            return Err(AccessError::Cancelled);
        }
        let mut queue = self.deployments.lock().unwrap();
        let front = queue.front().cloned().ok_or_else(|| AccessError::NotFound(format!("get_deployment: {}", id)))?;
        if queue.len() > 1 {
            queue.pop_front();
        }
        Ok(front)
    }

    async fn owned_pods(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<Vec<Pod>, AccessError> {
        if cancel.is_cancelled() {
            return Err(AccessError::Cancelled);
        }
        self.check_lists()?;
        let sets = self.replica_sets.lock().unwrap().clone();
        let pods = self.pods.lock().unwrap().clone();
        owner::select_owned_pods(deployment, &sets, pods)
    }

    async fn events_for(&self, object: &ObjectMeta, _cancel: &CancellationToken) -> Result<Vec<Event>, AccessError> {
        self.check_lists()?;
        let events = self.events.lock().unwrap().clone();
        Ok(owner::events_involving(object, events))
    }

    async fn stream_logs(&self, pod: &Pod, sink: &dyn LogSink, cancel: &CancellationToken) -> Result<(), AccessError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        *self.log_attempts.lock().unwrap().entry(name.clone()).or_insert(0) += 1;
        let behavior = self.logs.lock().unwrap().get(&name).cloned().unwrap_or(LogBehavior::Follow);
        match behavior {
            LogBehavior::FailOpen => Err(AccessError::transport("open_pod_logs", "logs endpoint unavailable")),
            LogBehavior::Lines(lines) => {
                sink.attached(&name);
                for l in &lines {
                    sink.line(&name, l);
                }
                Ok(())
            }
            LogBehavior::Break(lines) => {
                sink.attached(&name);
                for l in &lines {
                    sink.line(&name, l);
                }
                Err(AccessError::transport("pod_logs", "connection reset by peer"))
            }
            LogBehavior::Follow => {
                sink.attached(&name);
                cancel.cancelled().await;
                Err(AccessError::Cancelled)
            }
        }
    }
}

/// Sink that records lines per pod.
#[derive(Default)]
pub struct CollectSink(pub Mutex<Vec<(String, String)>>);

impl LogSink for CollectSink {
    fn line(&self, pod: &str, line: &str) {
        self.0.lock().unwrap().push((pod.to_string(), line.to_string()));
    }
}

pub fn workload_id() -> WorkloadId {
    WorkloadId::new(NS, "web")
}

fn meta(name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NS.to_string()),
        uid: Some(uid.to_string()),
        ..Default::default()
    }
}

fn owned_by(uid: &str) -> Option<Vec<OwnerReference>> {
    Some(vec![OwnerReference {
        api_version: "apps/v1".into(),
        kind: "ReplicaSet".into(),
        name: "owner".into(),
        uid: uid.to_string(),
        controller: Some(true),
        ..Default::default()
    }])
}

fn revision(rev: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(ANNOTATION_REVISION.to_string(), rev.to_string())]))
}

/// Deployment `web` (uid `d-web`, revision 1) with replica counters
/// `desired/current/available/updated`.
pub fn deployment(desired: i32, current: i32, available: i32, updated: i32) -> Deployment {
    let mut metadata = meta("web", "d-web");
    metadata.annotations = revision("1");
    Deployment {
        metadata,
        spec: Some(DeploymentSpec { replicas: Some(desired), ..Default::default() }),
        status: Some(DeploymentStatus {
            replicas: Some(current),
            available_replicas: Some(available),
            updated_replicas: Some(updated),
            ..Default::default()
        }),
    }
}

pub fn with_condition(mut d: Deployment, reason: &str, message: &str) -> Deployment {
    let status = d.status.get_or_insert_with(Default::default);
    status.conditions.get_or_insert_with(Vec::new).push(DeploymentCondition {
        type_: "Progressing".into(),
        status: "False".into(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    });
    d
}

/// ReplicaSet owned by deployment `d-web`.
pub fn replica_set(name: &str, uid: &str, rev: &str) -> ReplicaSet {
    let mut metadata = meta(name, uid);
    metadata.annotations = revision(rev);
    metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name: "web".into(),
        uid: "d-web".into(),
        controller: Some(true),
        ..Default::default()
    }]);
    ReplicaSet { metadata, ..Default::default() }
}

/// Pod `name` (uid `uid-<name>`) owned by the ReplicaSet with `rs_uid`.
pub fn pod(name: &str, rs_uid: &str) -> Pod {
    let mut metadata = meta(name, &format!("uid-{name}"));
    metadata.owner_references = owned_by(rs_uid);
    Pod { metadata, ..Default::default() }
}

pub fn with_pod_condition(mut p: Pod, reason: &str, message: &str) -> Pod {
    let status = p.status.get_or_insert_with(PodStatus::default);
    status.conditions.get_or_insert_with(Vec::new).push(PodCondition {
        type_: "Ready".into(),
        status: "False".into(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    });
    p
}

pub fn with_container(mut p: Pod, name: &str, ready: bool, waiting: Option<(&str, &str)>) -> Pod {
    let status = p.status.get_or_insert_with(PodStatus::default);
    status.container_statuses.get_or_insert_with(Vec::new).push(ContainerStatus {
        name: name.to_string(),
        ready,
        state: Some(ContainerState {
            waiting: waiting.map(|(reason, message)| ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    p
}

pub fn event(involved_uid: &str, type_: &str, reason: &str, message: &str) -> Event {
    Event {
        metadata: ObjectMeta { name: Some(format!("ev-{reason}")), namespace: Some(NS.to_string()), ..Default::default() },
        involved_object: ObjectReference { uid: Some(involved_uid.to_string()), ..Default::default() },
        type_: Some(type_.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    }
}
