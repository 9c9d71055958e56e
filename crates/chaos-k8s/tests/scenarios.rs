//! End-to-end lifecycles: the reconciler driving the shipped strategies
//! against an in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use chaos_core::api::ClusterObject;
use chaos_core::clock::{Clock, ManualClock};
use chaos_core::config::ControllerSettings;
use chaos_core::error::ChaosError;
use chaos_core::event::{ChannelEventSink, ExperimentEvent};
use chaos_core::experiment::{ChaosExperiment, ExperimentKey, ExperimentPhase, TargetKind};
use chaos_core::fake::{FakeCluster, FakeOp};
use chaos_core::reconciler::{reconcile_until_settled, ReconcileAction, Reconciler};
use chaos_core::safety::{NetworkProber, SafetyEngine, StaticMetricSource};
use chaos_core::status::CONDITION_CHAOS_REMOVED;
use chaos_k8s::injectors::default_registry;

struct Scenario {
    cluster: Arc<FakeCluster>,
    clock: Arc<ManualClock>,
    reconciler: Reconciler,
    events: UnboundedReceiver<ExperimentEvent>,
}

impl Scenario {
    fn new() -> Self {
        Self::with_settings(ControllerSettings::default())
    }

    fn with_settings(settings: ControllerSettings) -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let registry = default_registry(cluster.clone(), Some(42));
        let safety = SafetyEngine::new(
            cluster.clone(),
            Arc::new(NetworkProber::new(Duration::from_millis(200))),
            Arc::new(StaticMetricSource::default()),
        )
        .with_protected_namespaces(settings.protected_namespaces.clone())
        .with_retry_interval(Duration::ZERO);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        let mut reconciler = Reconciler::new(cluster.clone(), Arc::new(registry), safety, settings)
            .with_clock(clock.clone());
        let (sink, events) = ChannelEventSink::new();
        reconciler.add_event_sink(Arc::new(sink));
        Self {
            cluster,
            clock,
            reconciler,
            events,
        }
    }

    async fn apply(&self, manifest: &str) -> ExperimentKey {
        let experiment: ChaosExperiment = serde_yaml::from_str(manifest).unwrap();
        self.cluster.insert_experiment(experiment).await.key()
    }

    async fn settle(&self, key: &ExperimentKey) -> ReconcileAction {
        reconcile_until_settled(&self.reconciler, key, 10).await.unwrap()
    }

    async fn stored(&self, key: &ExperimentKey) -> ChaosExperiment {
        self.cluster.experiment(key).await.unwrap()
    }

    fn phases(&mut self) -> Vec<ExperimentPhase> {
        let mut phases = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ExperimentEvent::PhaseChanged { to, .. } = event {
                phases.push(to);
            }
        }
        phases
    }
}

#[tokio::test]
async fn pod_failure_deletes_the_named_pod_and_completes() {
    let mut s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "default", "test-pod"))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: kill-test-pod
  namespace: default
spec:
  target:
    name: test-pod
    targetType: Pod
  chaosType: PodFailure
  duration: 1s
"#,
        )
        .await;

    assert_eq!(
        s.settle(&key).await,
        ReconcileAction::RequeueAfter(Duration::from_secs(1))
    );
    assert!(s
        .cluster
        .object(TargetKind::Pod, "default", "test-pod")
        .await
        .is_none());

    s.clock.advance(Duration::from_secs(1));
    s.settle(&key).await;

    let exp = s.stored(&key).await;
    assert_eq!(exp.phase(), Some(ExperimentPhase::Completed));
    assert!(exp.status.as_ref().unwrap().end_time.is_some());
    assert_eq!(
        s.phases(),
        [
            ExperimentPhase::Pending,
            ExperimentPhase::Running,
            ExperimentPhase::Completed
        ]
    );
}

#[tokio::test]
async fn statefulset_scaling_scales_down_and_restores() {
    let mut s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::StatefulSet, "default", "web").with_replicas(3))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: shrink-web
  namespace: default
spec:
  target:
    name: web
    targetType: StatefulSet
  chaosType: StatefulSetScaling
  duration: 2m
  parameters:
    scaleMode: down
    scaleCount: "2"
    scaleMin: "1"
"#,
        )
        .await;

    s.settle(&key).await;
    let sts = s
        .cluster
        .object(TargetKind::StatefulSet, "default", "web")
        .await
        .unwrap();
    assert_eq!(sts.replicas, Some(1));
    assert_eq!(sts.annotation("chaos-agents.io/original-replicas"), Some("3"));

    // Monitoring passes before the window closes leave chaos in place.
    s.clock.advance(Duration::from_secs(30));
    assert_eq!(
        s.settle(&key).await,
        ReconcileAction::RequeueAfter(Duration::from_secs(30))
    );
    s.clock.advance(Duration::from_secs(90));
    s.settle(&key).await;

    let sts = s
        .cluster
        .object(TargetKind::StatefulSet, "default", "web")
        .await
        .unwrap();
    assert_eq!(sts.replicas, Some(3));
    assert!(sts.annotation("chaos-agents.io/original-replicas").is_none());
    assert_eq!(s.stored(&key).await.phase(), Some(ExperimentPhase::Completed));
    assert_eq!(
        s.phases(),
        [
            ExperimentPhase::Pending,
            ExperimentPhase::Running,
            ExperimentPhase::Completed
        ]
    );
}

#[tokio::test]
async fn missing_target_fails_without_injection() {
    let mut s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "default", "test-pod"))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: kill-ghost
  namespace: default
spec:
  target:
    name: non-existent-pod
    targetType: Pod
  chaosType: PodFailure
  duration: 1m
"#,
        )
        .await;

    assert_eq!(s.settle(&key).await, ReconcileAction::AwaitChange);

    let exp = s.stored(&key).await;
    assert_eq!(exp.phase(), Some(ExperimentPhase::Failed));
    let reason = exp.status.unwrap().failure_reason.unwrap();
    assert!(reason.contains("not found"), "unexpected reason: {reason}");
    assert_eq!(s.phases(), [ExperimentPhase::Pending, ExperimentPhase::Failed]);
    assert!(s.cluster.deletions().await.is_empty());
}

#[tokio::test]
async fn protected_namespace_blocks_injection() {
    // Only the experiment's own protection rule guards kube-system here.
    let mut s = Scenario::with_settings(ControllerSettings {
        protected_namespaces: vec![],
        ..ControllerSettings::default()
    });
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "kube-system", "coredns-0"))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: kill-dns
  namespace: default
spec:
  target:
    name: coredns-0
    namespace: kube-system
    targetType: Pod
  chaosType: PodFailure
  duration: 1m
  safety:
    resourceProtections:
      - type: Namespace
        value: kube-system
"#,
        )
        .await;

    s.settle(&key).await;

    let exp = s.stored(&key).await;
    assert_eq!(exp.phase(), Some(ExperimentPhase::Failed));
    assert!(exp
        .status
        .unwrap()
        .failure_reason
        .unwrap()
        .contains("kube-system"));
    assert!(s
        .cluster
        .object(TargetKind::Pod, "kube-system", "coredns-0")
        .await
        .is_some());
    assert!(s.cluster.deletions().await.is_empty());
    assert_eq!(s.phases(), [ExperimentPhase::Pending, ExperimentPhase::Failed]);
}

#[tokio::test]
async fn deleting_a_running_latency_experiment_cleans_the_pods() {
    let s = Scenario::new();
    for name in ["api-0", "api-1"] {
        s.cluster
            .insert(ClusterObject::new(TargetKind::Pod, "shop", name).with_labels(&[("app", "api")]))
            .await;
    }
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: slow-api
  namespace: shop
spec:
  target:
    targetType: Pod
    selector:
      matchLabels:
        app: api
  chaosType: NetworkLatency
  duration: 10m
  parameters:
    latency: 300ms
"#,
        )
        .await;

    s.settle(&key).await;
    for name in ["api-0", "api-1"] {
        let pod = s.cluster.object(TargetKind::Pod, "shop", name).await.unwrap();
        assert_eq!(pod.annotation("chaos-agents.io/network-latency-value"), Some("300ms"));
    }

    assert!(!s.cluster.delete_experiment(&key, s.clock.now()).await);
    s.settle(&key).await;

    assert!(s.cluster.experiment(&key).await.is_none());
    for name in ["api-0", "api-1"] {
        let pod = s.cluster.object(TargetKind::Pod, "shop", name).await.unwrap();
        assert!(pod.annotations().is_empty(), "{name} still annotated");
    }
}

#[tokio::test]
async fn invalid_disk_failure_parameters_fail_before_touching_pods() {
    let mut s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "db", "pg-0"))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: break-disk
  namespace: db
spec:
  target:
    name: pg-0
    targetType: Pod
  chaosType: DiskFailure
  duration: 1m
  parameters:
    failureMode: readonly
"#,
        )
        .await;

    s.settle(&key).await;

    let exp = s.stored(&key).await;
    assert_eq!(exp.phase(), Some(ExperimentPhase::Failed));
    assert!(exp.status.unwrap().failure_reason.unwrap().contains("mountPath"));
    let pod = s.cluster.object(TargetKind::Pod, "db", "pg-0").await.unwrap();
    assert!(pod.annotations().is_empty());
    assert_eq!(s.phases(), [ExperimentPhase::Pending, ExperimentPhase::Failed]);
}

const SHORT_POD_KILL: &str = r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: kill-test-pod
  namespace: default
spec:
  target:
    name: test-pod
    targetType: Pod
  chaosType: PodFailure
  duration: 5m
"#;

async fn assert_terminated_early(s: &Scenario, key: &ExperimentKey) {
    s.clock.advance(Duration::from_secs(30));
    assert_eq!(s.settle(key).await, ReconcileAction::AwaitChange);

    let status = s.stored(key).await.status.unwrap();
    assert_eq!(status.phase, Some(ExperimentPhase::Completed));
    assert!(status.end_time.is_some());
    let removed = status.latest_condition(CONDITION_CHAOS_REMOVED).unwrap();
    assert_eq!(removed.reason.as_deref(), Some("TargetTerminated"));
}

#[tokio::test]
async fn pod_failure_completes_before_expiry_once_the_pod_is_gone() {
    let s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "default", "test-pod"))
        .await;
    let key = s.apply(SHORT_POD_KILL).await;

    assert_eq!(
        s.settle(&key).await,
        ReconcileAction::RequeueAfter(Duration::from_secs(30))
    );
    assert_eq!(s.stored(&key).await.phase(), Some(ExperimentPhase::Running));
    assert!(s
        .cluster
        .object(TargetKind::Pod, "default", "test-pod")
        .await
        .is_none());

    assert_terminated_early(&s, &key).await;
}

#[tokio::test]
async fn pod_failure_completes_before_expiry_once_the_pod_is_replaced() {
    let s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::Pod, "default", "test-pod"))
        .await;
    let key = s.apply(SHORT_POD_KILL).await;
    s.settle(&key).await;

    // The owning controller brings the pod back under the same name.
    let replacement = s
        .cluster
        .insert(ClusterObject::new(TargetKind::Pod, "default", "test-pod"))
        .await;
    let recorded = s.stored(&key).await.target_resources()[0].uid.clone();
    assert!(recorded.is_some());
    assert_ne!(replacement.uid(), recorded.as_deref());

    assert_terminated_early(&s, &key).await;
}

#[tokio::test]
async fn deleting_after_a_lost_running_write_still_restores_replicas() {
    let s = Scenario::new();
    s.cluster
        .insert(ClusterObject::new(TargetKind::StatefulSet, "default", "web").with_replicas(3))
        .await;
    let key = s
        .apply(
            r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: shrink-web
  namespace: default
spec:
  target:
    name: web
    targetType: StatefulSet
  chaosType: StatefulSetScaling
  duration: 2m
  parameters:
    scaleMode: down
    scaleCount: "2"
"#,
        )
        .await;

    // finalizer, then Pending with resolved targets
    s.reconciler.reconcile(&key).await.unwrap();
    s.reconciler.reconcile(&key).await.unwrap();

    s.cluster
        .fail_next(FakeOp::UpdateExperimentStatus, ChaosError::Conflict("stale".into()))
        .await;
    assert!(s.reconciler.reconcile(&key).await.unwrap_err().is_transient());
    assert_eq!(s.stored(&key).await.phase(), Some(ExperimentPhase::Pending));
    let sts = s
        .cluster
        .object(TargetKind::StatefulSet, "default", "web")
        .await
        .unwrap();
    assert_eq!(sts.replicas, Some(1));

    assert!(!s.cluster.delete_experiment(&key, s.clock.now()).await);
    assert_eq!(s.settle(&key).await, ReconcileAction::AwaitChange);

    assert!(s.cluster.experiment(&key).await.is_none());
    let sts = s
        .cluster
        .object(TargetKind::StatefulSet, "default", "web")
        .await
        .unwrap();
    assert_eq!(sts.replicas, Some(3));
    assert!(sts.annotation("chaos-agents.io/original-replicas").is_none());
}
