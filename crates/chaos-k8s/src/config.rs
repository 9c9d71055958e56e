use serde::{Deserialize, Serialize};
use std::path::Path;

use chaos_core::config::{load_yaml, ControllerSettings, MetricsSettings};
use chaos_core::error::ChaosResult;

/// How to reach the API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConnection {
    /// Path to kubeconfig. If None, uses in-cluster config or default.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Only watch experiments in this namespace. All namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
}

/// Operator config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    #[serde(default)]
    pub kubernetes: KubeConnection,
    #[serde(default)]
    pub settings: ControllerSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl OperatorConfig {
    pub fn from_file(path: &Path) -> ChaosResult<Self> {
        load_yaml(path)
    }

    /// Defaults when no file is given.
    pub fn load(path: Option<&Path>) -> ChaosResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_full_operator_file() {
        let yaml = r#"
kubernetes:
  kubeconfig: /home/ops/.kube/config
  watchNamespace: chaos
settings:
  monitorInterval: 15s
  defaultDuration: 10m
  maxConcurrent: 8
  protectedNamespaces: [kube-system, monitoring]
metrics:
  prometheusUrl: http://prometheus.monitoring:9090
"#;
        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kubernetes.watch_namespace.as_deref(), Some("chaos"));
        assert_eq!(config.settings.monitor_interval, Duration::from_secs(15));
        assert_eq!(config.settings.default_duration, Duration::from_secs(600));
        assert_eq!(config.settings.max_concurrent, 8);
        assert_eq!(config.settings.probe_timeout, Duration::from_secs(5));
        assert_eq!(
            config.settings.protected_namespaces,
            ["kube-system", "monitoring"]
        );
        assert_eq!(
            config.metrics.prometheus_url.as_deref(),
            Some("http://prometheus.monitoring:9090")
        );
    }

    #[test]
    fn no_file_means_defaults() {
        let config = OperatorConfig::load(None).unwrap();
        assert!(config.kubernetes.kubeconfig.is_none());
        assert_eq!(config.settings, ControllerSettings::default());
    }
}
