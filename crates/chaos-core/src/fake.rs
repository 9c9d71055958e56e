//! In-memory cluster for tests and offline runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{ClusterApi, ClusterObject};
use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{ChaosExperiment, ExperimentKey, TargetKind};
use crate::selector::LabelQuery;

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Get,
    List,
    Create,
    Update,
    Delete,
    GetExperiment,
    UpdateExperiment,
    UpdateExperimentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRecord {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
    pub grace_period_seconds: Option<i64>,
}

type ObjectKey = (TargetKind, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ClusterObject>,
    experiments: BTreeMap<ExperimentKey, ChaosExperiment>,
    deletions: Vec<DeletionRecord>,
    failures: Vec<(FakeOp, ChaosError)>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, op: FakeOp) -> ChaosResult<()> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(self.failures.remove(i).1),
            None => Ok(()),
        }
    }
}

fn object_key(kind: TargetKind, namespace: &str, name: &str) -> ObjectKey {
    let ns = if kind.is_namespaced() { namespace } else { "" };
    (kind, ns.to_string(), name.to_string())
}

fn check_version(stored: Option<&str>, incoming: Option<&str>, what: &str) -> ChaosResult<()> {
    match incoming {
        Some(v) if Some(v) != stored => Err(ChaosError::Conflict(what.to_string())),
        _ => Ok(()),
    }
}

/// Behaves like an API server for the verbs the controller uses: resource
/// versions are checked on write, experiments with finalizers linger with a
/// deletion timestamp until the last finalizer is removed.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is, assigning a uid and resource version.
    pub async fn insert(&self, mut object: ClusterObject) -> ClusterObject {
        let mut state = self.state.lock().await;
        if object.metadata.uid.is_none() {
            object.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        object.metadata.resource_version = Some(state.bump());
        let key = object_key(object.kind, object.namespace(), object.name());
        state.objects.insert(key, object.clone());
        object
    }

    pub async fn object(&self, kind: TargetKind, namespace: &str, name: &str) -> Option<ClusterObject> {
        let state = self.state.lock().await;
        state.objects.get(&object_key(kind, namespace, name)).cloned()
    }

    pub async fn insert_experiment(&self, mut experiment: ChaosExperiment) -> ChaosExperiment {
        let mut state = self.state.lock().await;
        if experiment.metadata.uid.is_none() {
            experiment.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        if experiment.metadata.creation_timestamp.is_none() {
            experiment.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        experiment.metadata.resource_version = Some(state.bump());
        state.experiments.insert(experiment.key(), experiment.clone());
        experiment
    }

    pub async fn experiment(&self, key: &ExperimentKey) -> Option<ChaosExperiment> {
        self.state.lock().await.experiments.get(key).cloned()
    }

    /// A user deleting the experiment. Returns whether it was removed outright.
    pub async fn delete_experiment(&self, key: &ExperimentKey, at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let Some(experiment) = state.experiments.get_mut(key) else {
            return false;
        };
        if experiment.metadata.finalizers.as_ref().map_or(true, Vec::is_empty) {
            state.experiments.remove(key);
            return true;
        }
        if experiment.metadata.deletion_timestamp.is_none() {
            experiment.metadata.deletion_timestamp = Some(Time(at));
            experiment.metadata.resource_version = Some(version);
        }
        false
    }

    pub async fn deletions(&self) -> Vec<DeletionRecord> {
        self.state.lock().await.deletions.clone()
    }

    /// The next call of `op` fails with `error`.
    pub async fn fail_next(&self, op: FakeOp, error: ChaosError) {
        self.state.lock().await.failures.push((op, error));
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> ChaosResult<Option<ClusterObject>> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Get)?;
        Ok(state.objects.get(&object_key(kind, namespace, name)).cloned())
    }

    async fn list(
        &self,
        kind: TargetKind,
        namespace: &str,
        selector: &LabelQuery,
    ) -> ChaosResult<Vec<ClusterObject>> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::List)?;
        let ns = if kind.is_namespaced() { namespace } else { "" };
        Ok(state
            .objects
            .iter()
            .filter(|((k, n, _), o)| *k == kind && n == ns && selector.matches(&o.labels()))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, mut object: ClusterObject) -> ChaosResult<ClusterObject> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Create)?;
        let key = object_key(object.kind, object.namespace(), object.name());
        if state.objects.contains_key(&key) {
            return Err(ChaosError::Conflict(format!(
                "{} {}/{} already exists",
                object.kind,
                object.namespace(),
                object.name()
            )));
        }
        object.metadata.uid = Some(Uuid::new_v4().to_string());
        object.metadata.resource_version = Some(state.bump());
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, mut object: ClusterObject) -> ChaosResult<ClusterObject> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Update)?;
        let key = object_key(object.kind, object.namespace(), object.name());
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| ChaosError::not_found(object.kind.as_str(), object.namespace(), object.name()))?;
        check_version(
            stored.resource_version(),
            object.resource_version(),
            &format!("{} {}/{}", object.kind, object.namespace(), object.name()),
        )?;
        object.metadata.uid = stored.metadata.uid.clone();
        object.metadata.resource_version = Some(state.bump());
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> ChaosResult<bool> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Delete)?;
        let removed = state
            .objects
            .remove(&object_key(kind, namespace, name))
            .is_some();
        if removed {
            state.deletions.push(DeletionRecord {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                grace_period_seconds,
            });
        }
        Ok(removed)
    }

    async fn get_experiment(&self, key: &ExperimentKey) -> ChaosResult<Option<ChaosExperiment>> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::GetExperiment)?;
        Ok(state.experiments.get(key).cloned())
    }

    async fn update_experiment(&self, experiment: &ChaosExperiment) -> ChaosResult<ChaosExperiment> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::UpdateExperiment)?;
        let key = experiment.key();
        let version = state.bump();
        let stored = state
            .experiments
            .get_mut(&key)
            .ok_or_else(|| ChaosError::not_found("ChaosExperiment", &key.namespace, &key.name))?;
        check_version(
            stored.metadata.resource_version.as_deref(),
            experiment.metadata.resource_version.as_deref(),
            &key.to_string(),
        )?;

        stored.metadata.finalizers = experiment.metadata.finalizers.clone();
        stored.metadata.labels = experiment.metadata.labels.clone();
        stored.metadata.annotations = experiment.metadata.annotations.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().map_or(true, Vec::is_empty);
        if released {
            state.experiments.remove(&key);
        }
        Ok(updated)
    }

    async fn update_experiment_status(
        &self,
        experiment: &ChaosExperiment,
    ) -> ChaosResult<ChaosExperiment> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::UpdateExperimentStatus)?;
        let key = experiment.key();
        let version = state.bump();
        let stored = state
            .experiments
            .get_mut(&key)
            .ok_or_else(|| ChaosError::not_found("ChaosExperiment", &key.namespace, &key.name))?;
        check_version(
            stored.metadata.resource_version.as_deref(),
            experiment.metadata.resource_version.as_deref(),
            &key.to_string(),
        )?;
        stored.status = experiment.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ChaosExperimentSpec, EXPERIMENT_FINALIZER};

    fn experiment(name: &str) -> ChaosExperiment {
        let mut exp = ChaosExperiment::new(name, ChaosExperimentSpec::default());
        exp.metadata.namespace = Some("default".into());
        exp
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels_in_name_order() {
        let cluster = FakeCluster::new();
        for name in ["web-2", "web-0", "web-1"] {
            cluster
                .insert(ClusterObject::new(TargetKind::Pod, "shop", name).with_labels(&[("app", "web")]))
                .await;
        }
        cluster
            .insert(ClusterObject::new(TargetKind::Pod, "shop", "db-0").with_labels(&[("app", "db")]))
            .await;
        cluster
            .insert(ClusterObject::new(TargetKind::Pod, "other", "web-9").with_labels(&[("app", "web")]))
            .await;

        let query = LabelQuery::from_selector(&k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
            match_labels: Some([("app".to_string(), "web".to_string())].into()),
            ..Default::default()
        })
        .unwrap();
        let names: Vec<String> = cluster
            .list(TargetKind::Pod, "shop", &query)
            .await
            .unwrap()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(names, ["web-0", "web-1", "web-2"]);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = FakeCluster::new();
        let sts = cluster
            .insert(ClusterObject::new(TargetKind::StatefulSet, "db", "pg").with_replicas(3))
            .await;

        let mut first = sts.clone();
        first.replicas = Some(1);
        cluster.update(first).await.unwrap();

        let mut stale = sts;
        stale.replicas = Some(5);
        assert!(matches!(cluster.update(stale).await, Err(ChaosError::Conflict(_))));
        assert_eq!(
            cluster.object(TargetKind::StatefulSet, "db", "pg").await.unwrap().replicas,
            Some(1)
        );
    }

    #[tokio::test]
    async fn delete_reports_absence_and_records_grace_period() {
        let cluster = FakeCluster::new();
        cluster.insert(ClusterObject::new(TargetKind::Pod, "default", "p")).await;
        assert!(cluster.delete(TargetKind::Pod, "default", "p", Some(0)).await.unwrap());
        assert!(!cluster.delete(TargetKind::Pod, "default", "p", Some(0)).await.unwrap());
        assert_eq!(cluster.deletions().await.len(), 1);
        assert_eq!(cluster.deletions().await[0].grace_period_seconds, Some(0));
    }

    #[tokio::test]
    async fn finalizer_blocks_experiment_removal() {
        let cluster = FakeCluster::new();
        let mut exp = experiment("exp");
        exp.metadata.finalizers = Some(vec![EXPERIMENT_FINALIZER.to_string()]);
        let key = cluster.insert_experiment(exp).await.key();

        assert!(!cluster.delete_experiment(&key, Utc::now()).await);
        let mut pending = cluster.experiment(&key).await.unwrap();
        assert!(pending.is_deleting());

        pending.metadata.finalizers = Some(vec![]);
        cluster.update_experiment(&pending).await.unwrap();
        assert!(cluster.experiment(&key).await.is_none());
    }

    #[tokio::test]
    async fn scripted_failures_fire_once() {
        let cluster = FakeCluster::new();
        cluster
            .fail_next(FakeOp::Get, ChaosError::TransientApi("throttled".into()))
            .await;
        assert!(cluster.get(TargetKind::Pod, "default", "x").await.is_err());
        assert!(cluster.get(TargetKind::Pod, "default", "x").await.unwrap().is_none());
    }
}
