//! Safety evaluation: protected resources, health probes and metric
//! thresholds, checked in that order. The first violation wins.

pub mod metrics;
pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::{ClusterApi, ClusterObject};
use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{
    ChaosExperiment, HealthCheckSpec, PauseConditionSpec, ProtectionSpec, TargetKind,
    TargetResourceRecord,
};

pub use metrics::{MetricSource, PrometheusMetricSource, StaticMetricSource};
pub use probe::{HealthProber, NetworkProber, PodExecutor};

/// Annotation that operators put on a resource to keep chaos away from it.
pub const PROTECTED_ANNOTATION: &str = "chaos-agents.io/protected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Proceed,
    Rollback(String),
}

impl SafetyDecision {
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback(_))
    }
}

pub struct SafetyEngine {
    api: Arc<dyn ClusterApi>,
    prober: Arc<dyn HealthProber>,
    metrics: Arc<dyn MetricSource>,
    protected_namespaces: Vec<String>,
    retry_interval: Duration,
}

impl SafetyEngine {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        prober: Arc<dyn HealthProber>,
        metrics: Arc<dyn MetricSource>,
    ) -> Self {
        Self {
            api,
            prober,
            metrics,
            protected_namespaces: vec!["kube-system".to_string()],
            retry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_protected_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.protected_namespaces = namespaces;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub async fn evaluate(&self, experiment: &ChaosExperiment) -> ChaosResult<SafetyDecision> {
        let decision = self.check_protected(experiment).await?;
        if decision.is_rollback() {
            return Ok(decision);
        }

        let decision = self.check_health(experiment).await?;
        if decision.is_rollback() {
            return Ok(decision);
        }

        Ok(self.check_metrics(experiment).await)
    }

    async fn check_protected(&self, experiment: &ChaosExperiment) -> ChaosResult<SafetyDecision> {
        let key = experiment.key();
        let target_ns = experiment.spec.target.namespace_or(&key.namespace).to_string();
        let targets = experiment.target_resources();
        let rules: &[ProtectionSpec] = experiment
            .spec
            .safety
            .as_ref()
            .map(|s| s.resource_protections.as_slice())
            .unwrap_or_default();

        let mut namespaces = vec![target_ns.as_str()];
        namespaces.extend(targets.iter().map(|t| t.namespace()).filter(|ns| !ns.is_empty()));

        for ns in &namespaces {
            if self.protected_namespaces.iter().any(|p| p == ns) {
                return Ok(SafetyDecision::Rollback(format!(
                    "Target namespace {ns} is protected"
                )));
            }
        }

        for rule in rules {
            match rule.type_.as_str() {
                "Namespace" => {
                    if namespaces.iter().any(|ns| *ns == rule.value) {
                        return Ok(SafetyDecision::Rollback(format!(
                            "Target namespace {} is protected",
                            rule.value
                        )));
                    }
                }
                "Name" => {
                    let named = experiment.spec.target.exact_name() == Some(rule.value.as_str());
                    if named || targets.iter().any(|t| t.name == rule.value) {
                        return Ok(SafetyDecision::Rollback(format!(
                            "Target {} is protected",
                            rule.value
                        )));
                    }
                }
                "Label" | "Annotation" => {}
                other => warn!(experiment = %key, rule = other, "Unknown protection rule type, ignoring"),
            }
        }

        let live_rules: Vec<&ProtectionSpec> = rules
            .iter()
            .filter(|r| r.type_ == "Label" || r.type_ == "Annotation")
            .collect();

        for target in targets {
            let Some(object) = self.live_object(target).await? else {
                debug!(kind = %target.kind, name = %target.name, "Target gone, skipping live protection check");
                continue;
            };
            let id = format!("{} {}/{}", target.kind, target.namespace(), target.name);

            if object.annotation(PROTECTED_ANNOTATION) == Some("true") {
                return Ok(SafetyDecision::Rollback(format!(
                    "{id} has protection annotation"
                )));
            }

            for rule in &live_rules {
                let source = if rule.type_ == "Label" {
                    object.labels()
                } else {
                    object.annotations()
                };
                if rule_matches(&rule.value, &source) {
                    return Ok(SafetyDecision::Rollback(format!(
                        "{id} is protected by {} rule '{}'",
                        rule.type_.to_lowercase(),
                        rule.value
                    )));
                }
            }
        }

        Ok(SafetyDecision::Proceed)
    }

    async fn live_object(&self, target: &TargetResourceRecord) -> ChaosResult<Option<ClusterObject>> {
        self.api.get(target.kind, target.namespace(), &target.name).await
    }

    async fn check_health(&self, experiment: &ChaosExperiment) -> ChaosResult<SafetyDecision> {
        let Some(safety) = &experiment.spec.safety else {
            return Ok(SafetyDecision::Proceed);
        };
        for check in &safety.health_checks {
            if let Some(reason) = self.run_health_check(experiment, check).await? {
                return Ok(SafetyDecision::Rollback(reason));
            }
        }
        Ok(SafetyDecision::Proceed)
    }

    /// `Some(reason)` when the check failed `failureThreshold` times in a row.
    async fn run_health_check(
        &self,
        experiment: &ChaosExperiment,
        check: &HealthCheckSpec,
    ) -> ChaosResult<Option<String>> {
        let host = check.host.as_deref().unwrap_or("localhost");
        match check.type_.as_str() {
            "httpGet" => {
                let port = probe_port(check)?;
                let path = check.path.as_deref().unwrap_or("/");
                let url = format!("http://{host}:{port}{path}");
                let healthy = self.attempts(check, || self.prober.http_get(&url)).await;
                Ok((!healthy).then(|| format!("Health check failed for endpoint {path}:{port}")))
            }
            "tcpSocket" => {
                let port = probe_port(check)?;
                let healthy = self
                    .attempts(check, || self.prober.tcp_connect(host, port))
                    .await;
                Ok((!healthy).then(|| format!("Health check failed for TCP port {port}")))
            }
            "exec" => {
                if check.command.is_empty() {
                    return Err(ChaosError::Validation(
                        "exec health check requires a command".into(),
                    ));
                }
                let pods: Vec<&TargetResourceRecord> = experiment
                    .target_resources()
                    .iter()
                    .filter(|t| t.kind == TargetKind::Pod)
                    .collect();
                if pods.is_empty() {
                    warn!(experiment = %experiment.key(), "exec health check has no pod targets, skipping");
                }
                for pod in pods {
                    let healthy = self
                        .attempts(check, || {
                            self.prober.exec(pod.namespace(), &pod.name, &check.command)
                        })
                        .await;
                    if !healthy {
                        return Ok(Some(format!(
                            "Health check failed for command '{}' in pod {}/{}",
                            check.command.join(" "),
                            pod.namespace(),
                            pod.name
                        )));
                    }
                }
                Ok(None)
            }
            other => {
                warn!(experiment = %experiment.key(), check = other, "Unknown health check type, ignoring");
                Ok(None)
            }
        }
    }

    async fn attempts<F, Fut>(&self, check: &HealthCheckSpec, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let threshold = check.failure_threshold.unwrap_or(1).max(1);
        for attempt in 1..=threshold {
            if probe().await {
                return true;
            }
            if attempt < threshold {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        false
    }

    async fn check_metrics(&self, experiment: &ChaosExperiment) -> SafetyDecision {
        let Some(safety) = &experiment.spec.safety else {
            return SafetyDecision::Proceed;
        };
        for condition in &safety.pause_conditions {
            if let Some(reason) = self.breached(experiment, condition).await {
                return SafetyDecision::Rollback(reason);
            }
        }
        SafetyDecision::Proceed
    }

    async fn breached(
        &self,
        experiment: &ChaosExperiment,
        condition: &PauseConditionSpec,
    ) -> Option<String> {
        if condition.type_ != "metric" {
            return None;
        }
        let key = experiment.key();
        let query = condition.metric_query.as_deref()?;
        let raw = condition.threshold.as_deref().unwrap_or_default();
        let threshold: f64 = match raw.trim().parse() {
            Ok(t) => t,
            Err(_) => {
                warn!(experiment = %key, query, threshold = raw, "Failed to parse threshold, skipping");
                return None;
            }
        };
        let value = match self.metrics.query(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(experiment = %key, query, error = %e, "Metric query failed, skipping");
                return None;
            }
        };
        (value > threshold)
            .then(|| format!("Metric {query} exceeds threshold: {value} > {threshold}"))
    }
}

fn probe_port(check: &HealthCheckSpec) -> ChaosResult<u16> {
    check
        .port
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or_else(|| {
            ChaosError::Validation(format!("{} health check requires a valid port", check.type_))
        })
}

/// `key` or `key=value` against a label or annotation map.
fn rule_matches(rule: &str, map: &std::collections::BTreeMap<String, String>) -> bool {
    match rule.split_once('=') {
        Some((k, v)) => map.get(k.trim()).is_some_and(|actual| actual == v.trim()),
        None => map.contains_key(rule.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ChaosExperimentSpec, ChaosExperimentStatus, SafetySpec, TargetSpec};
    use crate::fake::FakeCluster;
    use metrics::MockMetricSource;
    use mockall::predicate::eq;
    use probe::MockHealthProber;

    fn experiment(namespace: &str, safety: SafetySpec) -> ChaosExperiment {
        let mut exp = ChaosExperiment::new(
            "exp",
            ChaosExperimentSpec {
                target: TargetSpec {
                    name: Some("web-0".into()),
                    target_type: Some("Pod".into()),
                    ..Default::default()
                },
                chaos_type: "PodFailure".into(),
                duration: "1m".into(),
                safety: Some(safety),
                ..Default::default()
            },
        );
        exp.metadata.namespace = Some(namespace.into());
        exp.status = Some(ChaosExperimentStatus {
            target_resources: vec![TargetResourceRecord {
                kind: TargetKind::Pod,
                name: "web-0".into(),
                namespace: Some(namespace.into()),
                uid: None,
                status: None,
            }],
            ..Default::default()
        });
        exp
    }

    fn engine(cluster: Arc<FakeCluster>, prober: MockHealthProber, metrics: MockMetricSource) -> SafetyEngine {
        SafetyEngine::new(cluster, Arc::new(prober), Arc::new(metrics))
            .with_retry_interval(Duration::ZERO)
    }

    async fn cluster_with(pod: ClusterObject) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert(pod).await;
        cluster
    }

    #[tokio::test]
    async fn reserved_namespace_is_protected() {
        let cluster = cluster_with(ClusterObject::new(TargetKind::Pod, "kube-system", "web-0")).await;
        let engine = engine(cluster, MockHealthProber::new(), MockMetricSource::new());
        let decision = engine
            .evaluate(&experiment("kube-system", SafetySpec::default()))
            .await
            .unwrap();
        assert_eq!(
            decision,
            SafetyDecision::Rollback("Target namespace kube-system is protected".into())
        );
    }

    #[tokio::test]
    async fn protection_rules_and_annotation() {
        let cluster = cluster_with(
            ClusterObject::new(TargetKind::Pod, "shop", "web-0").with_labels(&[("tier", "critical")]),
        )
        .await;
        let engine = engine(cluster.clone(), MockHealthProber::new(), MockMetricSource::new());

        let by_name = SafetySpec {
            resource_protections: vec![ProtectionSpec {
                type_: "Name".into(),
                value: "web-0".into(),
            }],
            ..Default::default()
        };
        assert!(engine.evaluate(&experiment("shop", by_name)).await.unwrap().is_rollback());

        let by_label = SafetySpec {
            resource_protections: vec![ProtectionSpec {
                type_: "Label".into(),
                value: "tier=critical".into(),
            }],
            ..Default::default()
        };
        assert!(engine.evaluate(&experiment("shop", by_label)).await.unwrap().is_rollback());

        let other_label = SafetySpec {
            resource_protections: vec![ProtectionSpec {
                type_: "Label".into(),
                value: "tier=batch".into(),
            }],
            ..Default::default()
        };
        assert_eq!(
            engine.evaluate(&experiment("shop", other_label)).await.unwrap(),
            SafetyDecision::Proceed
        );

        cluster
            .insert(
                ClusterObject::new(TargetKind::Pod, "shop", "web-0")
                    .with_annotation(PROTECTED_ANNOTATION, "true"),
            )
            .await;
        let decision = engine
            .evaluate(&experiment("shop", SafetySpec::default()))
            .await
            .unwrap();
        assert_eq!(
            decision,
            SafetyDecision::Rollback("Pod shop/web-0 has protection annotation".into())
        );
    }

    #[tokio::test]
    async fn health_check_respects_failure_threshold() {
        let cluster = cluster_with(ClusterObject::new(TargetKind::Pod, "shop", "web-0")).await;
        let mut prober = MockHealthProber::new();
        let mut calls = 0;
        prober
            .expect_http_get()
            .with(eq("http://localhost:8080/healthz"))
            .times(2)
            .returning(move |_| {
                calls += 1;
                calls == 2
            });
        let engine = engine(cluster, prober, MockMetricSource::new());

        let safety = SafetySpec {
            health_checks: vec![HealthCheckSpec {
                type_: "httpGet".into(),
                path: Some("/healthz".into()),
                port: Some(8080),
                failure_threshold: Some(3),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            engine.evaluate(&experiment("shop", safety)).await.unwrap(),
            SafetyDecision::Proceed
        );
    }

    #[tokio::test]
    async fn failing_tcp_probe_rolls_back() {
        let cluster = cluster_with(ClusterObject::new(TargetKind::Pod, "shop", "web-0")).await;
        let mut prober = MockHealthProber::new();
        prober
            .expect_tcp_connect()
            .with(eq("db.shop.svc"), eq(5432))
            .times(1)
            .returning(|_, _| false);
        let engine = engine(cluster, prober, MockMetricSource::new());

        let safety = SafetySpec {
            health_checks: vec![HealthCheckSpec {
                type_: "tcpSocket".into(),
                host: Some("db.shop.svc".into()),
                port: Some(5432),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            engine.evaluate(&experiment("shop", safety)).await.unwrap(),
            SafetyDecision::Rollback("Health check failed for TCP port 5432".into())
        );
    }

    #[tokio::test]
    async fn metric_threshold_breach_and_skips() {
        let cluster = cluster_with(ClusterObject::new(TargetKind::Pod, "shop", "web-0")).await;
        let mut metrics = MockMetricSource::new();
        metrics
            .expect_query()
            .with(eq("mongodb_connections"))
            .returning(|_| Ok(120.0));
        metrics
            .expect_query()
            .with(eq("broken"))
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        let engine = engine(cluster, MockHealthProber::new(), metrics);

        let condition = |query: &str, threshold: &str| PauseConditionSpec {
            type_: "metric".into(),
            metric_query: Some(query.into()),
            threshold: Some(threshold.into()),
        };

        let skipped = SafetySpec {
            pause_conditions: vec![
                condition("broken", "1"),
                condition("mongodb_connections", "lots"),
                PauseConditionSpec {
                    type_: "manual".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            engine.evaluate(&experiment("shop", skipped)).await.unwrap(),
            SafetyDecision::Proceed
        );

        let breached = SafetySpec {
            pause_conditions: vec![condition("mongodb_connections", "100")],
            ..Default::default()
        };
        assert_eq!(
            engine.evaluate(&experiment("shop", breached)).await.unwrap(),
            SafetyDecision::Rollback("Metric mongodb_connections exceeds threshold: 120 > 100".into())
        );
    }

    #[tokio::test]
    async fn protection_is_checked_before_probes() {
        let cluster = cluster_with(ClusterObject::new(TargetKind::Pod, "kube-system", "web-0")).await;
        let mut prober = MockHealthProber::new();
        prober.expect_http_get().never();
        let engine = engine(cluster, prober, MockMetricSource::new());
        let safety = SafetySpec {
            health_checks: vec![HealthCheckSpec {
                type_: "httpGet".into(),
                port: Some(80),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(engine.evaluate(&experiment("kube-system", safety)).await.unwrap().is_rollback());
    }

    #[test]
    fn rule_matching_accepts_key_or_pair() {
        let map = [("tier".to_string(), "critical".to_string())].into();
        assert!(rule_matches("tier", &map));
        assert!(rule_matches("tier=critical", &map));
        assert!(!rule_matches("tier=batch", &map));
        assert!(!rule_matches("team", &map));
    }
}
