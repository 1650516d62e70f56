//! Ownership matching: Deployment -> active ReplicaSet -> Pods.
//!
//! Owner references are derived from a closed set of handled kinds, each
//! resolved from its static `apiVersion`/`kind` pair.

use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1 as core_v1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::{Metadata, Resource};

use crate::{AccessError, ANNOTATION_REVISION};

/// Object kinds that can own something in a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    ReplicaSet,
    Pod,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Deployment, ObjectKind::ReplicaSet, ObjectKind::Pod];

    pub fn api_version(self) -> &'static str {
        match self {
            Self::Deployment => <apps::Deployment as Resource>::API_VERSION,
            Self::ReplicaSet => <apps::ReplicaSet as Resource>::API_VERSION,
            Self::Pod => <core_v1::Pod as Resource>::API_VERSION,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::Deployment => <apps::Deployment as Resource>::KIND,
            Self::ReplicaSet => <apps::ReplicaSet as Resource>::KIND,
            Self::Pod => <core_v1::Pod as Resource>::KIND,
        }
    }

    /// Resolve an `apiVersion`/`kind` pair to exactly one handled kind.
    pub fn resolve(api_version: &str, kind: &str) -> Result<Self, AccessError> {
        let candidates: Vec<ObjectKind> = Self::ALL
            .iter()
            .copied()
            .filter(|k| k.api_version() == api_version && k.kind() == kind)
            .collect();
        match candidates.as_slice() {
            [one] => Ok(*one),
            other => Err(AccessError::AmbiguousKind(format!(
                "expected 1 kind for {}/{}, got {}: {:?}",
                api_version,
                kind,
                other.len(),
                other
            ))),
        }
    }

    pub fn of<K: Resource>() -> Result<Self, AccessError> {
        Self::resolve(K::API_VERSION, K::KIND)
    }
}

/// Build a controller owner reference pointing at `owner`.
///
/// Returns `Ok(None)` for objects without a uid (never persisted), which by
/// construction own nothing.
pub fn controller_ref<K>(owner: &K) -> Result<Option<OwnerReference>, AccessError>
where
    K: Resource + Metadata<Ty = ObjectMeta>,
{
    let kind = ObjectKind::of::<K>()?;
    let meta = owner.metadata();
    let Some(uid) = meta.uid.clone() else { return Ok(None) };
    Ok(Some(OwnerReference {
        api_version: kind.api_version().to_string(),
        kind: kind.kind().to_string(),
        name: meta.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    }))
}

/// True if any owner reference of `meta` carries the reference's uid.
pub fn has_owner_reference(meta: &ObjectMeta, reference: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.uid == reference.uid)
}

pub fn revision(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations.as_ref()?.get(ANNOTATION_REVISION).map(String::as_str)
}

/// Both objects carry a revision annotation and the values are equal.
pub fn has_same_revision(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    match (revision(a), revision(b)) {
        (Some(ra), Some(rb)) => ra == rb,
        _ => false,
    }
}

/// Pick the active generation of `deployment` among `replica_sets`.
/// With several matches the last one in list order wins.
pub fn active_generation<'a>(
    deployment: &apps::Deployment,
    replica_sets: &'a [apps::ReplicaSet],
) -> Result<Option<&'a apps::ReplicaSet>, AccessError> {
    let Some(reference) = controller_ref(deployment)? else { return Ok(None) };
    Ok(replica_sets
        .iter()
        .filter(|rs| has_owner_reference(&rs.metadata, &reference) && has_same_revision(&rs.metadata, &deployment.metadata))
        .last())
}

/// Keep the pods owned by `owner`, preserving list order.
pub fn owned_by<K>(owner: &K, pods: Vec<core_v1::Pod>) -> Result<Vec<core_v1::Pod>, AccessError>
where
    K: Resource + Metadata<Ty = ObjectMeta>,
{
    let Some(reference) = controller_ref(owner)? else { return Ok(Vec::new()) };
    Ok(pods.into_iter().filter(|p| has_owner_reference(&p.metadata, &reference)).collect())
}

/// Resolve the pods of a deployment's active generation from namespace listings.
pub fn select_owned_pods(
    deployment: &apps::Deployment,
    replica_sets: &[apps::ReplicaSet],
    pods: Vec<core_v1::Pod>,
) -> Result<Vec<core_v1::Pod>, AccessError> {
    match active_generation(deployment, replica_sets)? {
        Some(rs) => owned_by(rs, pods),
        None => Ok(Vec::new()),
    }
}

/// Events whose involved object is the object described by `meta`.
pub fn events_involving(meta: &ObjectMeta, events: Vec<core_v1::Event>) -> Vec<core_v1::Event> {
    let Some(uid) = meta.uid.as_deref() else { return Vec::new() };
    events
        .into_iter()
        .filter(|ev| ev.involved_object.uid.as_deref() == Some(uid))
        .collect()
}
