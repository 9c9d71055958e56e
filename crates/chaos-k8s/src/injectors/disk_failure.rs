use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chaos_core::api::ClusterApi;
use chaos_core::error::{ChaosError, ChaosResult};
use chaos_core::experiment::{ChaosExperiment, ChaosType, TargetKind, TargetResourceRecord};
use chaos_core::injector::{annotation_key, Injector, InjectorDescriptor, ParameterDescriptor};

use super::{edit_target, strip_annotations};

const DISK_FAILURE: &str = "disk-failure";
const DISK_FAILURE_MOUNT: &str = "disk-failure-mount";
const DISK_FAILURE_MODE: &str = "disk-failure-mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl FailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::WriteOnly => "writeonly",
            Self::ReadWrite => "readwrite",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureMode {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Self::ReadOnly),
            "writeonly" => Ok(Self::WriteOnly),
            "readwrite" => Ok(Self::ReadWrite),
            other => Err(ChaosError::Validation(format!(
                "failureMode must be one of readonly, writeonly, readwrite, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct DiskFailureParams {
    mode: FailureMode,
    mount_path: String,
}

impl DiskFailureParams {
    fn parse(params: &BTreeMap<String, String>) -> ChaosResult<Self> {
        let required = |key: &str| {
            params
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ChaosError::Validation(format!("{key} is required")))
        };
        Ok(Self {
            mode: required("failureMode")?.parse()?,
            mount_path: required("mountPath")?.to_string(),
        })
    }
}

fn keys() -> Vec<String> {
    [DISK_FAILURE, DISK_FAILURE_MOUNT, DISK_FAILURE_MODE]
        .into_iter()
        .map(annotation_key)
        .collect()
}

/// Marks pods for disk failure. The node-side agent reading the marks does
/// the actual I/O interference.
pub struct DiskFailureInjector {
    api: Arc<dyn ClusterApi>,
}

impl DiskFailureInjector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    async fn mark_pod(&self, target: &TargetResourceRecord, params: &DiskFailureParams) -> ChaosResult<()> {
        let edited = edit_target(self.api.as_ref(), target, |pod| {
            pod.set_annotation(&annotation_key(DISK_FAILURE), "true");
            pod.set_annotation(&annotation_key(DISK_FAILURE_MOUNT), &params.mount_path);
            pod.set_annotation(&annotation_key(DISK_FAILURE_MODE), params.mode.as_str());
            true
        })
        .await?;
        if edited.is_none() {
            return Err(ChaosError::not_found(
                target.kind.as_str(),
                target.namespace(),
                &target.name,
            ));
        }
        tracing::info!(
            pod = %target.name,
            namespace = %target.namespace(),
            mode = %params.mode,
            mount_path = %params.mount_path,
            "Marked pod for disk failure"
        );
        Ok(())
    }
}

#[async_trait]
impl Injector for DiskFailureInjector {
    fn descriptor(&self) -> InjectorDescriptor {
        InjectorDescriptor {
            chaos_type: ChaosType::DiskFailure,
            description: "Mark volumes of target pods as failing".into(),
            target_kinds: vec![
                TargetKind::Pod,
                TargetKind::StatefulSet,
                TargetKind::PersistentVolumeClaim,
            ],
            parameters: vec![
                ParameterDescriptor::required(
                    "failureMode",
                    "One of readonly, writeonly, readwrite",
                ),
                ParameterDescriptor::required("mountPath", "Mount path inside the pod"),
            ],
        }
    }

    fn validate_params(&self, params: &BTreeMap<String, String>) -> ChaosResult<()> {
        DiskFailureParams::parse(params).map(|_| ())
    }

    async fn inject(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let params = DiskFailureParams::parse(&experiment.spec.parameters)?;

        for target in targets {
            match target.kind {
                TargetKind::Pod => self.mark_pod(target, &params).await?,
                TargetKind::StatefulSet | TargetKind::PersistentVolumeClaim => {
                    self.api
                        .get(target.kind, target.namespace(), &target.name)
                        .await?
                        .ok_or_else(|| {
                            ChaosError::not_found(
                                target.kind.as_str(),
                                target.namespace(),
                                &target.name,
                            )
                        })?;
                    tracing::info!(
                        kind = %target.kind,
                        name = %target.name,
                        namespace = %target.namespace(),
                        mode = %params.mode,
                        "Disk failure on this kind is not applied, target left untouched"
                    );
                }
                other => tracing::warn!(
                    kind = %other,
                    name = %target.name,
                    "DiskFailure does not apply to this kind, skipping"
                ),
            }
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        _experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let keys = keys();
        for target in targets.iter().filter(|t| t.kind == TargetKind::Pod) {
            strip_annotations(self.api.as_ref(), target, &keys).await?;
        }
        Ok(())
    }
}
