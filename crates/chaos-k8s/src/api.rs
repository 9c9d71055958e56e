//! [`ClusterApi`] over a live API server.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;

use chaos_core::api::{ClusterApi, ClusterObject};
use chaos_core::error::{ChaosError, ChaosResult};
use chaos_core::experiment::{ChaosExperiment, ExperimentKey, TargetKind};
use chaos_core::selector::LabelQuery;

/// A Kubernetes type that can be targeted.
trait TargetResource:
    Resource<DynamicType = ()> + Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: TargetKind;

    fn api(client: Client, namespace: &str) -> Api<Self>;

    fn replicas(&self) -> Option<i32> {
        None
    }

    fn set_replicas(&mut self, _replicas: Option<i32>) {}
}

impl TargetResource for Pod {
    const KIND: TargetKind = TargetKind::Pod;
    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl TargetResource for StatefulSet {
    const KIND: TargetKind = TargetKind::StatefulSet;
    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }

    fn set_replicas(&mut self, replicas: Option<i32>) {
        self.spec.get_or_insert_with(Default::default).replicas = replicas;
    }
}

impl TargetResource for Deployment {
    const KIND: TargetKind = TargetKind::Deployment;
    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }

    fn set_replicas(&mut self, replicas: Option<i32>) {
        self.spec.get_or_insert_with(Default::default).replicas = replicas;
    }
}

impl TargetResource for PersistentVolumeClaim {
    const KIND: TargetKind = TargetKind::PersistentVolumeClaim;
    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl TargetResource for PersistentVolume {
    const KIND: TargetKind = TargetKind::PersistentVolume;
    fn api(client: Client, _namespace: &str) -> Api<Self> {
        Api::all(client)
    }
}

impl TargetResource for Service {
    const KIND: TargetKind = TargetKind::Service;
    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

fn to_object<K: TargetResource>(resource: K) -> ClusterObject {
    ClusterObject {
        kind: K::KIND,
        replicas: resource.replicas(),
        metadata: resource.meta().clone(),
    }
}

/// Translate an API server failure into the controller's taxonomy.
pub fn api_error(err: kube::Error, kind: &str, namespace: &str, name: &str) -> ChaosError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ChaosError::not_found(kind, namespace, name),
            409 => ChaosError::Conflict(format!("{kind} {namespace}/{name}")),
            400 | 422 => ChaosError::Validation(response.message),
            429 | 500..=599 => ChaosError::TransientApi(response.message),
            _ => ChaosError::Other(kube::Error::Api(response).into()),
        },
        kube::Error::SerdeError(e) => ChaosError::Other(e.into()),
        other => ChaosError::TransientApi(other.to_string()),
    }
}

async fn get_typed<K: TargetResource>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> ChaosResult<Option<ClusterObject>> {
    K::api(client.clone(), namespace)
        .get_opt(name)
        .await
        .map(|found| found.map(to_object))
        .map_err(|e| api_error(e, K::KIND.as_str(), namespace, name))
}

async fn list_typed<K: TargetResource>(
    client: &Client,
    namespace: &str,
    selector: &LabelQuery,
) -> ChaosResult<Vec<ClusterObject>> {
    let mut params = ListParams::default();
    if !selector.is_everything() {
        params = params.labels(&selector.to_string());
    }
    let list = K::api(client.clone(), namespace)
        .list(&params)
        .await
        .map_err(|e| api_error(e, K::KIND.as_str(), namespace, "*"))?;
    let mut objects: Vec<ClusterObject> = list.items.into_iter().map(to_object).collect();
    objects.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(objects)
}

async fn create_typed<K: TargetResource>(
    client: &Client,
    object: ClusterObject,
) -> ChaosResult<ClusterObject> {
    let namespace = object.namespace().to_string();
    let name = object.name().to_string();
    let mut resource = K::default();
    resource.set_replicas(object.replicas);
    *resource.meta_mut() = object.metadata;
    K::api(client.clone(), &namespace)
        .create(&PostParams::default(), &resource)
        .await
        .map(to_object)
        .map_err(|e| api_error(e, K::KIND.as_str(), &namespace, &name))
}

/// Writes labels, annotations and replicas onto the live object. The
/// resource version carried by `object` must still be current.
async fn update_typed<K: TargetResource>(
    client: &Client,
    object: ClusterObject,
) -> ChaosResult<ClusterObject> {
    let namespace = object.namespace().to_string();
    let name = object.name().to_string();
    let api = K::api(client.clone(), &namespace);
    let fail = |e: kube::Error| api_error(e, K::KIND.as_str(), &namespace, &name);

    let mut current = api
        .get_opt(&name)
        .await
        .map_err(fail)?
        .ok_or_else(|| ChaosError::not_found(K::KIND.as_str(), &namespace, &name))?;
    if let Some(expected) = object.resource_version() {
        if current.resource_version().as_deref() != Some(expected) {
            return Err(ChaosError::Conflict(format!("{} {namespace}/{name}", K::KIND)));
        }
    }

    if K::KIND.is_scalable() {
        current.set_replicas(object.replicas);
    }
    let meta = current.meta_mut();
    meta.labels = object.metadata.labels;
    meta.annotations = object.metadata.annotations;

    api.replace(&name, &PostParams::default(), &current)
        .await
        .map(to_object)
        .map_err(fail)
}

async fn delete_typed<K: TargetResource>(
    client: &Client,
    namespace: &str,
    name: &str,
    grace_period_seconds: Option<i64>,
) -> ChaosResult<bool> {
    let params = DeleteParams {
        grace_period_seconds: grace_period_seconds.and_then(|g| u32::try_from(g).ok()),
        ..DeleteParams::default()
    };
    match K::api(client.clone(), namespace).delete(name, &params).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(api_error(e, K::KIND.as_str(), namespace, name)),
    }
}

macro_rules! by_kind {
    ($kind:expr, $op:ident($($arg:expr),*)) => {
        match $kind {
            TargetKind::Pod => $op::<Pod>($($arg),*).await,
            TargetKind::StatefulSet => $op::<StatefulSet>($($arg),*).await,
            TargetKind::Deployment => $op::<Deployment>($($arg),*).await,
            TargetKind::PersistentVolumeClaim => $op::<PersistentVolumeClaim>($($arg),*).await,
            TargetKind::PersistentVolume => $op::<PersistentVolume>($($arg),*).await,
            TargetKind::Service => $op::<Service>($($arg),*).await,
        }
    };
}

pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn experiments(&self, namespace: &str) -> Api<ChaosExperiment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> ChaosResult<Option<ClusterObject>> {
        by_kind!(kind, get_typed(&self.client, namespace, name))
    }

    async fn list(
        &self,
        kind: TargetKind,
        namespace: &str,
        selector: &LabelQuery,
    ) -> ChaosResult<Vec<ClusterObject>> {
        by_kind!(kind, list_typed(&self.client, namespace, selector))
    }

    async fn create(&self, object: ClusterObject) -> ChaosResult<ClusterObject> {
        by_kind!(object.kind, create_typed(&self.client, object))
    }

    async fn update(&self, object: ClusterObject) -> ChaosResult<ClusterObject> {
        by_kind!(object.kind, update_typed(&self.client, object))
    }

    async fn delete(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> ChaosResult<bool> {
        by_kind!(kind, delete_typed(&self.client, namespace, name, grace_period_seconds))
    }

    async fn get_experiment(&self, key: &ExperimentKey) -> ChaosResult<Option<ChaosExperiment>> {
        self.experiments(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error(e, "ChaosExperiment", &key.namespace, &key.name))
    }

    async fn update_experiment(
        &self,
        experiment: &ChaosExperiment,
    ) -> ChaosResult<ChaosExperiment> {
        let key = experiment.key();
        // resourceVersion in a merge patch makes the server reject stale writes.
        let patch = json!({
            "metadata": {
                "resourceVersion": experiment.metadata.resource_version,
                "finalizers": experiment.metadata.finalizers,
            }
        });
        self.experiments(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, "ChaosExperiment", &key.namespace, &key.name))
    }

    async fn update_experiment_status(
        &self,
        experiment: &ChaosExperiment,
    ) -> ChaosResult<ChaosExperiment> {
        let key = experiment.key();
        let patch = json!({
            "metadata": { "resourceVersion": experiment.metadata.resource_version },
            "status": experiment.status,
        });
        self.experiments(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, "ChaosExperiment", &key.namespace, &key.name))
    }
}
