use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ChaosError, ChaosResult};

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerSettings {
    /// Requeue cadence while an experiment is Running.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Chaos window used when an experiment's duration does not parse.
    #[serde(with = "humantime_serde")]
    pub default_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Spacing between consecutive attempts of one health check.
    #[serde(with = "humantime_serde")]
    pub probe_retry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub conflict_requeue: Duration,
    #[serde(with = "humantime_serde")]
    pub transient_requeue: Duration,
    #[serde(with = "humantime_serde")]
    pub error_requeue: Duration,
    pub max_concurrent: u16,
    pub protected_namespaces: Vec<String>,
    /// Fixes random target selection and random scaling when set.
    pub selection_seed: Option<u64>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            default_duration: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            probe_retry_interval: Duration::from_secs(1),
            conflict_requeue: Duration::from_secs(1),
            transient_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(30),
            max_concurrent: 4,
            protected_namespaces: vec!["kube-system".to_string()],
            selection_seed: None,
        }
    }
}

/// Where pause-condition metrics come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    pub prometheus_url: Option<String>,
    /// Fixed values by query, used when no Prometheus URL is configured.
    #[serde(rename = "static")]
    pub static_values: BTreeMap<String, f64>,
}

/// Read and parse a YAML file.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> ChaosResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ChaosError::Config(format!("Cannot read {}: {e}", path.display())))?;
    serde_yaml::from_str(&content).map_err(|e| ChaosError::Config(format!("Invalid YAML: {e}")))
}
