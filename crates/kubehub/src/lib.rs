//! rollcheck kubehub: read-only access to the cluster state a rollout check needs.
//!
//! Every call goes to the API server; nothing is cached, so a rollout that
//! supersedes another mid-watch is picked up on the next call.

#![forbid(unsafe_code)]

mod logs;

pub use logs::{default_container, relay_lines, LogSink, TracingSink};

use std::future::Future;
use std::time::Instant;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, LogParams},
    Client,
};
use metrics::{counter, histogram};
use rollcheck_core::{owner, AccessError, WorkloadId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State accessor consumed by the detector.
///
/// All methods observe `cancel`: a cancelled token aborts the in-flight
/// request with [`AccessError::Cancelled`].
#[async_trait::async_trait]
pub trait ClusterState: Send + Sync {
    /// Fetch the tracked Deployment.
    async fn get_workload(&self, id: &WorkloadId, cancel: &CancellationToken) -> Result<Deployment, AccessError>;

    /// Pods of the deployment's active ReplicaSet (owner uid + matching revision).
    /// Empty when no generation or no pod matches.
    async fn owned_pods(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<Vec<Pod>, AccessError>;

    /// Events whose involved object has the uid in `object`.
    async fn events_for(&self, object: &ObjectMeta, cancel: &CancellationToken) -> Result<Vec<Event>, AccessError>;

    /// Follow the pod's logs, relaying lines to `sink` until the stream ends.
    /// `sink.attached` is called once the stream has opened.
    async fn stream_logs(&self, pod: &Pod, sink: &dyn LogSink, cancel: &CancellationToken) -> Result<(), AccessError>;
}

/// [`ClusterState`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeState {
    client: Client,
}

impl KubeState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default kubeconfig / in-cluster environment.
    pub async fn try_default() -> Result<Self, AccessError> {
        let client = Client::try_default()
            .await
            .map_err(|e| AccessError::transport("building kube client", e))?;
        Ok(Self::new(client))
    }

    fn namespace_of<'a>(&'a self, meta: &'a ObjectMeta) -> &'a str {
        meta.namespace.as_deref().unwrap_or_else(|| self.client.default_namespace())
    }
}

#[async_trait::async_trait]
impl ClusterState for KubeState {
    async fn get_workload(&self, id: &WorkloadId, cancel: &CancellationToken) -> Result<Deployment, AccessError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &id.namespace);
        cancellable(cancel, "get_deployment", api.get(&id.name)).await
    }

    async fn owned_pods(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<Vec<Pod>, AccessError> {
        let ns = self.namespace_of(&deployment.metadata);
        let lp = ListParams::default();

        let sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
        let sets = cancellable(cancel, "list_replicasets", sets.list(&lp)).await?;
        let Some(active) = owner::active_generation(deployment, &sets.items)? else {
            debug!(ns = %ns, deployment = ?deployment.metadata.name, "no active replica set");
            return Ok(Vec::new());
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let pods = cancellable(cancel, "list_pods", pods.list(&lp)).await?;
        owner::owned_by(active, pods.items)
    }

    async fn events_for(&self, object: &ObjectMeta, cancel: &CancellationToken) -> Result<Vec<Event>, AccessError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), self.namespace_of(object));
        let events = cancellable(cancel, "list_events", api.list(&ListParams::default())).await?;
        Ok(owner::events_involving(object, events.items))
    }

    async fn stream_logs(&self, pod: &Pod, sink: &dyn LogSink, cancel: &CancellationToken) -> Result<(), AccessError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AccessError::NotFound("pod without metadata.name".to_string()))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), self.namespace_of(&pod.metadata));
        let lp = LogParams { follow: true, container: default_container(pod), ..LogParams::default() };

        let reader = cancellable(cancel, "open_pod_logs", api.log_stream(name, &lp)).await?;
        info!(pod = %name, container = ?lp.container, "log stream attached");
        sink.attached(name);
        let stream = ReaderStream::new(reader.compat());
        relay_lines(stream, name, sink, cancel).await
    }
}

/// Await a kube request unless `cancel` fires first; map kube errors into the accessor taxonomy.
async fn cancellable<T, F>(cancel: &CancellationToken, op: &'static str, fut: F) -> Result<T, AccessError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    let started = Instant::now();
    let res = tokio::select! {
        _ = cancel.cancelled() => return Err(AccessError::Cancelled),
        res = fut => res,
    };
    histogram!("rollcheck_api_request_ms", "op" => op).record(started.elapsed().as_secs_f64() * 1000.0);
    res.map_err(|e| {
        counter!("rollcheck_api_errors_total", "op" => op).increment(1);
        map_kube_error(op, e)
    })
}

fn map_kube_error(op: &str, err: kube::Error) -> AccessError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => AccessError::NotFound(format!("{}: {}", op, ae.message)),
        other => AccessError::transport(op, other),
    }
}
