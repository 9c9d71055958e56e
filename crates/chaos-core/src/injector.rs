use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{ChaosExperiment, ChaosType, TargetKind, TargetResourceRecord};

/// Prefix of every annotation written onto targets.
pub const ANNOTATION_PREFIX: &str = "chaos-agents.io/";

pub fn annotation_key(name: &str) -> String {
    format!("{ANNOTATION_PREFIX}{name}")
}

/// Metadata describing an injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorDescriptor {
    pub chaos_type: ChaosType,
    pub description: String,
    pub target_kinds: Vec<TargetKind>,
    pub parameters: Vec<ParameterDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default: Option<String>,
}

impl ParameterDescriptor {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, default: Option<&str>, description: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            default: default.map(str::to_string),
        }
    }
}

/// One fault type. Both `inject` and `cleanup` may be retried, so they must
/// be idempotent; `cleanup` must also succeed when nothing was injected.
#[async_trait]
pub trait Injector: Send + Sync {
    fn descriptor(&self) -> InjectorDescriptor;

    /// Reject bad parameters before anything on the cluster is touched.
    fn validate_params(&self, params: &BTreeMap<String, String>) -> ChaosResult<()>;

    async fn inject(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()>;

    async fn cleanup(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()>;
}

/// Chaos type to injector table, filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct InjectorRegistry {
    injectors: HashMap<ChaosType, Arc<dyn Injector>>,
}

impl InjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chaos_type: ChaosType, injector: Arc<dyn Injector>) {
        self.injectors.insert(chaos_type, injector);
    }

    pub fn lookup(&self, chaos_type: ChaosType) -> ChaosResult<Arc<dyn Injector>> {
        self.injectors
            .get(&chaos_type)
            .cloned()
            .ok_or_else(|| ChaosError::NoInjectorRegistered(chaos_type.to_string()))
    }

    pub fn descriptors(&self) -> Vec<InjectorDescriptor> {
        let mut descriptors: Vec<InjectorDescriptor> =
            self.injectors.values().map(|i| i.descriptor()).collect();
        descriptors.sort_by_key(|d| d.chaos_type.as_str());
        descriptors
    }

    pub fn len(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }
}

/// Read a parameter or fall back to `default`.
pub fn param_or<'a>(params: &'a BTreeMap<String, String>, key: &str, default: &'a str) -> &'a str {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

/// Parse an integer parameter, falling back to `default` when absent.
pub fn int_param(params: &BTreeMap<String, String>, key: &str, default: i64) -> ChaosResult<i64> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ChaosError::Validation(format!("parameter {key} must be an integer, got '{raw}'"))),
        None => Ok(default),
    }
}

/// Parse a boolean parameter; absent means false.
pub fn bool_param(params: &BTreeMap<String, String>, key: &str) -> ChaosResult<bool> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ChaosError::Validation(format!("parameter {key} must be true or false, got '{raw}'"))),
        None => Ok(false),
    }
}

/// Parse a duration parameter such as `100ms`, falling back to `default`.
pub fn duration_param(
    params: &BTreeMap<String, String>,
    key: &str,
    default: &str,
) -> ChaosResult<Duration> {
    let raw = param_or(params, key, default);
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| ChaosError::Validation(format!("parameter {key} must be a duration, got '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(ChaosType);

    #[async_trait]
    impl Injector for Noop {
        fn descriptor(&self) -> InjectorDescriptor {
            InjectorDescriptor {
                chaos_type: self.0,
                description: "does nothing".into(),
                target_kinds: vec![TargetKind::Pod],
                parameters: vec![],
            }
        }

        fn validate_params(&self, _params: &BTreeMap<String, String>) -> ChaosResult<()> {
            Ok(())
        }

        async fn inject(&self, _: &ChaosExperiment, _: &[TargetResourceRecord]) -> ChaosResult<()> {
            Ok(())
        }

        async fn cleanup(&self, _: &ChaosExperiment, _: &[TargetResourceRecord]) -> ChaosResult<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_of_unregistered_type_fails() {
        let mut registry = InjectorRegistry::new();
        registry.register(ChaosType::PodFailure, Arc::new(Noop(ChaosType::PodFailure)));
        assert!(registry.lookup(ChaosType::PodFailure).is_ok());
        assert!(matches!(
            registry.lookup(ChaosType::DataCorruption),
            Err(ChaosError::NoInjectorRegistered(t)) if t == "DataCorruption"
        ));
    }

    #[test]
    fn descriptors_are_sorted() {
        let mut registry = InjectorRegistry::new();
        for t in [ChaosType::StatefulSetScaling, ChaosType::DiskFailure, ChaosType::PodFailure] {
            registry.register(t, Arc::new(Noop(t)));
        }
        let names: Vec<&str> = registry.descriptors().iter().map(|d| d.chaos_type.as_str()).collect();
        assert_eq!(names, ["DiskFailure", "PodFailure", "StatefulSetScaling"]);
    }

    #[test]
    fn parameter_helpers() {
        let params: BTreeMap<String, String> = [
            ("podCount".to_string(), "3".to_string()),
            ("forceDelete".to_string(), "yes".to_string()),
            ("latency".to_string(), " ".to_string()),
        ]
        .into();
        assert_eq!(int_param(&params, "podCount", 1).unwrap(), 3);
        assert_eq!(int_param(&params, "gracePeriodSeconds", 0).unwrap(), 0);
        assert!(bool_param(&params, "forceDelete").is_err());
        assert_eq!(param_or(&params, "latency", "100ms"), "100ms");
        assert_eq!(
            duration_param(&params, "latency", "100ms").unwrap(),
            Duration::from_millis(100)
        );
        assert!(duration_param(&params, "podCount", "1s").is_err());
    }
}
