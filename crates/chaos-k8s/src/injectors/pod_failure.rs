use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use chaos_core::api::ClusterApi;
use chaos_core::error::{ChaosError, ChaosResult};
use chaos_core::experiment::{ChaosExperiment, ChaosType, TargetKind, TargetResourceRecord};
use chaos_core::injector::{
    bool_param, int_param, Injector, InjectorDescriptor, ParameterDescriptor,
};
use chaos_core::selector::LabelQuery;

/// Deletes pods and leaves recreation to their controllers.
pub struct PodFailureInjector {
    api: Arc<dyn ClusterApi>,
}

impl PodFailureInjector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    async fn kill(&self, namespace: &str, name: &str, params: &PodFailureParams) -> ChaosResult<()> {
        let deleted = self
            .api
            .delete(TargetKind::Pod, namespace, name, Some(params.grace_period_seconds))
            .await?;
        if deleted {
            tracing::info!(
                pod = %name,
                namespace = %namespace,
                grace_period_seconds = params.grace_period_seconds,
                "Deleted pod"
            );
        } else {
            tracing::debug!(pod = %name, namespace = %namespace, "Pod already gone");
        }
        Ok(())
    }

    /// Pods owned by the StatefulSet, in name order.
    async fn owned_pods(&self, namespace: &str, statefulset: &str) -> ChaosResult<Vec<String>> {
        let pods = self
            .api
            .list(TargetKind::Pod, namespace, &LabelQuery::everything())
            .await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.is_owned_by(TargetKind::StatefulSet, statefulset))
            .map(|p| p.name().to_string())
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PodFailureParams {
    grace_period_seconds: i64,
    pod_count: usize,
}

impl PodFailureParams {
    fn parse(params: &BTreeMap<String, String>) -> ChaosResult<Self> {
        let grace = int_param(params, "gracePeriodSeconds", 0)?;
        if grace < 0 {
            return Err(ChaosError::Validation(format!(
                "gracePeriodSeconds must not be negative, got {grace}"
            )));
        }
        let count = int_param(params, "podCount", 1)?;
        if count < 1 {
            return Err(ChaosError::Validation(format!(
                "podCount must be at least 1, got {count}"
            )));
        }
        let force = bool_param(params, "forceDelete")?;
        Ok(Self {
            grace_period_seconds: if force { 0 } else { grace },
            pod_count: count as usize,
        })
    }
}

#[async_trait]
impl Injector for PodFailureInjector {
    fn descriptor(&self) -> InjectorDescriptor {
        InjectorDescriptor {
            chaos_type: ChaosType::PodFailure,
            description: "Delete target pods, or pods owned by a target StatefulSet".into(),
            target_kinds: vec![TargetKind::Pod, TargetKind::StatefulSet],
            parameters: vec![
                ParameterDescriptor::optional(
                    "gracePeriodSeconds",
                    Some("0"),
                    "Grace period passed with the delete",
                ),
                ParameterDescriptor::optional(
                    "podCount",
                    Some("1"),
                    "Pods deleted per StatefulSet target",
                ),
                ParameterDescriptor::optional(
                    "forceDelete",
                    Some("false"),
                    "Delete immediately, ignoring gracePeriodSeconds",
                ),
            ],
        }
    }

    fn validate_params(&self, params: &BTreeMap<String, String>) -> ChaosResult<()> {
        PodFailureParams::parse(params).map(|_| ())
    }

    async fn inject(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let params = PodFailureParams::parse(&experiment.spec.parameters)?;

        for target in targets {
            match target.kind {
                TargetKind::Pod => self.kill(target.namespace(), &target.name, &params).await?,
                TargetKind::StatefulSet => {
                    let pods = self.owned_pods(target.namespace(), &target.name).await?;
                    if pods.is_empty() {
                        tracing::info!(
                            statefulset = %target.name,
                            namespace = %target.namespace(),
                            "StatefulSet has no pods to delete"
                        );
                    }
                    for pod in pods.iter().take(params.pod_count) {
                        self.kill(target.namespace(), pod, &params).await?;
                    }
                }
                other => tracing::warn!(
                    kind = %other,
                    name = %target.name,
                    "PodFailure does not apply to this kind, skipping"
                ),
            }
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        experiment: &ChaosExperiment,
        _targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        tracing::debug!(
            experiment = %experiment.key(),
            "Deleted pods are recreated by their controllers"
        );
        Ok(())
    }
}
