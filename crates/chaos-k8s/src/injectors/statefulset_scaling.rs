use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use chaos_core::api::ClusterApi;
use chaos_core::error::{ChaosError, ChaosResult};
use chaos_core::experiment::{ChaosExperiment, ChaosType, TargetKind, TargetResourceRecord};
use chaos_core::injector::{
    annotation_key, bool_param, int_param, param_or, Injector, InjectorDescriptor,
    ParameterDescriptor,
};
use chaos_core::target::selection_rng;

use super::edit_target;

/// Replica count observed before the first scale, restored on cleanup.
pub const ORIGINAL_REPLICAS: &str = "original-replicas";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleMode {
    Up,
    Down,
    Random,
}

#[derive(Debug, Clone, PartialEq)]
struct ScalingParams {
    mode: ScaleMode,
    count: i32,
    min: i32,
    max: i32,
}

impl ScalingParams {
    fn parse(params: &BTreeMap<String, String>) -> ChaosResult<Self> {
        let mode = match param_or(params, "scaleMode", "down").trim() {
            "up" => ScaleMode::Up,
            "down" => ScaleMode::Down,
            "random" => ScaleMode::Random,
            other => {
                return Err(ChaosError::Validation(format!(
                    "scaleMode must be one of up, down, random, got '{other}'"
                )))
            }
        };
        let count = int_param(params, "scaleCount", 1)?;
        let mut min = int_param(params, "scaleMin", 1)?;
        let max = int_param(params, "scaleMax", 10)?;
        if bool_param(params, "allowZero")? {
            min = 0;
        }

        if count < 1 {
            return Err(ChaosError::Validation(format!("scaleCount must be at least 1, got {count}")));
        }
        if min < 0 {
            return Err(ChaosError::Validation(format!("scaleMin must not be negative, got {min}")));
        }
        if max < 1 {
            return Err(ChaosError::Validation(format!("scaleMax must be at least 1, got {max}")));
        }
        if min > max {
            return Err(ChaosError::Validation(format!(
                "scaleMin ({min}) must not exceed scaleMax ({max})"
            )));
        }
        let narrow = |v: i64, key: &str| {
            i32::try_from(v).map_err(|_| ChaosError::Validation(format!("{key} is out of range: {v}")))
        };
        Ok(Self {
            mode,
            count: narrow(count, "scaleCount")?,
            min: narrow(min, "scaleMin")?,
            max: narrow(max, "scaleMax")?,
        })
    }

    fn target_replicas(&self, current: i32, rng: &mut impl Rng) -> i32 {
        match self.mode {
            ScaleMode::Down => current.saturating_sub(self.count).max(self.min),
            ScaleMode::Up => current.saturating_add(self.count).min(self.max),
            ScaleMode::Random => rng.gen_range(self.min..=self.max),
        }
    }
}

/// Changes StatefulSet replica counts and puts them back afterwards.
pub struct StatefulSetScalingInjector {
    api: Arc<dyn ClusterApi>,
    seed: Option<u64>,
}

impl StatefulSetScalingInjector {
    pub fn new(api: Arc<dyn ClusterApi>, seed: Option<u64>) -> Self {
        Self { api, seed }
    }
}

#[async_trait]
impl Injector for StatefulSetScalingInjector {
    fn descriptor(&self) -> InjectorDescriptor {
        InjectorDescriptor {
            chaos_type: ChaosType::StatefulSetScaling,
            description: "Scale target StatefulSets and restore the replica count afterwards".into(),
            target_kinds: vec![TargetKind::StatefulSet],
            parameters: vec![
                ParameterDescriptor::optional("scaleMode", Some("down"), "One of up, down, random"),
                ParameterDescriptor::optional("scaleCount", Some("1"), "Replicas added or removed"),
                ParameterDescriptor::optional("scaleMin", Some("1"), "Lower bound on replicas"),
                ParameterDescriptor::optional("scaleMax", Some("10"), "Upper bound on replicas"),
                ParameterDescriptor::optional(
                    "allowZero",
                    Some("false"),
                    "Allow scaling to zero, overrides scaleMin",
                ),
            ],
        }
    }

    fn validate_params(&self, params: &BTreeMap<String, String>) -> ChaosResult<()> {
        ScalingParams::parse(params).map(|_| ())
    }

    async fn inject(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let params = ScalingParams::parse(&experiment.spec.parameters)?;
        let mut rng = selection_rng(self.seed);
        let key = annotation_key(ORIGINAL_REPLICAS);

        for target in targets {
            if target.kind != TargetKind::StatefulSet {
                tracing::warn!(
                    kind = %target.kind,
                    name = %target.name,
                    "StatefulSetScaling only applies to StatefulSets, skipping"
                );
                continue;
            }
            let Some(mut sts) = self
                .api
                .get(target.kind, target.namespace(), &target.name)
                .await?
            else {
                return Err(ChaosError::not_found(
                    target.kind.as_str(),
                    target.namespace(),
                    &target.name,
                ));
            };

            // A recorded count means an earlier attempt already scaled; scale
            // from the original again instead of compounding.
            let current = sts.replicas.unwrap_or(1);
            let original = match sts.annotation(&key).and_then(|v| v.parse::<i32>().ok()) {
                Some(recorded) => recorded,
                None => {
                    sts.set_annotation(&key, &current.to_string());
                    current
                }
            };
            let desired = params.target_replicas(original, &mut rng);
            sts.replicas = Some(desired);
            self.api.update(sts).await?;

            tracing::info!(
                statefulset = %target.name,
                namespace = %target.namespace(),
                from = original,
                to = desired,
                "Scaled StatefulSet"
            );
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        _experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let key = annotation_key(ORIGINAL_REPLICAS);

        for target in targets.iter().filter(|t| t.kind == TargetKind::StatefulSet) {
            let mut restored = None;
            edit_target(self.api.as_ref(), target, |sts| {
                let Some(raw) = sts.annotation(&key).map(str::to_string) else {
                    return false;
                };
                match raw.parse::<i32>() {
                    Ok(replicas) => {
                        sts.replicas = Some(replicas);
                        restored = Some(replicas);
                    }
                    Err(_) => tracing::warn!(
                        statefulset = %target.name,
                        value = %raw,
                        "Unreadable original replica count, leaving replicas as they are"
                    ),
                }
                sts.remove_annotation(&key);
                true
            })
            .await?;

            if let Some(replicas) = restored {
                tracing::info!(
                    statefulset = %target.name,
                    namespace = %target.namespace(),
                    replicas,
                    "Restored StatefulSet replicas"
                );
            }
        }
        Ok(())
    }
}
