//! The cluster API as seen by the controller.
//!
//! Strategies, the resolver and the safety engine only ever talk to the
//! cluster through [`ClusterApi`], so the whole lifecycle can run against the
//! in-memory [`crate::fake::FakeCluster`] as well as a real API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::error::ChaosResult;
use crate::experiment::{ChaosExperiment, ExperimentKey, TargetKind};
use crate::selector::LabelQuery;

/// Kind-tagged view over a target resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterObject {
    pub kind: TargetKind,
    pub metadata: ObjectMeta,
    /// Desired replicas, only meaningful for scalable kinds.
    pub replicas: Option<i32>,
}

impl ClusterObject {
    pub fn new(kind: TargetKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: kind.is_namespaced().then(|| namespace.to_string()),
                ..Default::default()
            },
            replicas: None,
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        let map = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.set_annotation(key, value);
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn with_owner(mut self, kind: TargetKind, name: &str) -> Self {
        self.metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(OwnerReference {
                api_version: "apps/v1".into(),
                kind: kind.as_str().into(),
                name: name.into(),
                uid: String::new(),
                controller: Some(true),
                block_owner_deletion: None,
            });
        self
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Returns whether the key was present.
    pub fn remove_annotation(&mut self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_mut()
            .is_some_and(|a| a.remove(key).is_some())
    }

    pub fn is_owned_by(&self, kind: TargetKind, name: &str) -> bool {
        self.metadata
            .owner_references
            .iter()
            .flatten()
            .any(|r| r.kind == kind.as_str() && r.name == name)
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> ChaosResult<Option<ClusterObject>>;

    /// Objects of `kind` matching `selector`, in name order.
    async fn list(
        &self,
        kind: TargetKind,
        namespace: &str,
        selector: &LabelQuery,
    ) -> ChaosResult<Vec<ClusterObject>>;

    async fn create(&self, object: ClusterObject) -> ChaosResult<ClusterObject>;

    /// Fails with `Conflict` when the object's resource version is stale.
    async fn update(&self, object: ClusterObject) -> ChaosResult<ClusterObject>;

    /// `false` when the object was already gone.
    async fn delete(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> ChaosResult<bool>;

    async fn get_experiment(&self, key: &ExperimentKey) -> ChaosResult<Option<ChaosExperiment>>;

    /// Writes metadata (finalizers). Optimistic.
    async fn update_experiment(&self, experiment: &ChaosExperiment)
        -> ChaosResult<ChaosExperiment>;

    /// Writes the status sub-resource. Optimistic.
    async fn update_experiment_status(
        &self,
        experiment: &ChaosExperiment,
    ) -> ChaosResult<ChaosExperiment>;
}
