pub mod disk_failure;
pub mod network_latency;
pub mod pod_failure;
pub mod statefulset_scaling;

use std::sync::Arc;

use chaos_core::api::{ClusterApi, ClusterObject};
use chaos_core::error::ChaosResult;
use chaos_core::experiment::{ChaosType, TargetResourceRecord};
use chaos_core::injector::InjectorRegistry;

pub use disk_failure::DiskFailureInjector;
pub use network_latency::NetworkLatencyInjector;
pub use pod_failure::PodFailureInjector;
pub use statefulset_scaling::StatefulSetScalingInjector;

/// Every strategy this crate ships, keyed by chaos type.
pub fn default_registry(api: Arc<dyn ClusterApi>, seed: Option<u64>) -> InjectorRegistry {
    let mut registry = InjectorRegistry::new();
    registry.register(
        ChaosType::PodFailure,
        Arc::new(PodFailureInjector::new(api.clone())),
    );
    registry.register(
        ChaosType::DiskFailure,
        Arc::new(DiskFailureInjector::new(api.clone())),
    );
    registry.register(
        ChaosType::NetworkLatency,
        Arc::new(NetworkLatencyInjector::new(api.clone())),
    );
    registry.register(
        ChaosType::StatefulSetScaling,
        Arc::new(StatefulSetScalingInjector::new(api, seed)),
    );
    registry
}

/// Fetch the target, let `mutate` edit it and write it back if it reported a
/// change. Returns `None` when the target no longer exists.
pub(crate) async fn edit_target<F>(
    api: &dyn ClusterApi,
    target: &TargetResourceRecord,
    mutate: F,
) -> ChaosResult<Option<bool>>
where
    F: FnOnce(&mut ClusterObject) -> bool + Send,
{
    let Some(mut object) = api.get(target.kind, target.namespace(), &target.name).await? else {
        return Ok(None);
    };
    if !mutate(&mut object) {
        return Ok(Some(false));
    }
    api.update(object).await?;
    Ok(Some(true))
}

/// Drop `keys` from the target's annotations. Missing targets and missing
/// keys are fine.
pub(crate) async fn strip_annotations(
    api: &dyn ClusterApi,
    target: &TargetResourceRecord,
    keys: &[String],
) -> ChaosResult<()> {
    let edited = edit_target(api, target, |object| {
        keys.iter()
            .fold(false, |changed, key| object.remove_annotation(key) || changed)
    })
    .await?;
    match edited {
        None => tracing::debug!(
            kind = %target.kind,
            name = %target.name,
            "Target gone, nothing to clean up"
        ),
        Some(true) => tracing::info!(
            kind = %target.kind,
            namespace = %target.namespace(),
            name = %target.name,
            "Removed chaos annotations"
        ),
        Some(false) => {}
    }
    Ok(())
}
