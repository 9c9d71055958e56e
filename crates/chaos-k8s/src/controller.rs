//! Wires the reconciler into `kube::runtime`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};

use chaos_core::api::ClusterApi;
use chaos_core::config::{ControllerSettings, MetricsSettings};
use chaos_core::error::ChaosError;
use chaos_core::event::TracingEventSink;
use chaos_core::experiment::ChaosExperiment;
use chaos_core::reconciler::{ReconcileAction, Reconciler};
use chaos_core::safety::{
    MetricSource, NetworkProber, PrometheusMetricSource, SafetyEngine, StaticMetricSource,
};

use crate::api::KubeClusterApi;
use crate::client::create_client;
use crate::config::OperatorConfig;
use crate::exec::KubePodExecutor;
use crate::injectors::default_registry;

/// Shared state handed to every reconciliation.
pub struct Context {
    pub reconciler: Reconciler,
}

pub fn metric_source(metrics: &MetricsSettings, settings: &ControllerSettings) -> Arc<dyn MetricSource> {
    match metrics.prometheus_url {
        Some(ref url) => Arc::new(PrometheusMetricSource::new(url.clone(), settings.probe_timeout)),
        None => Arc::new(StaticMetricSource::new(metrics.static_values.clone())),
    }
}

/// Assemble the reconciler with the real cluster, probes and strategies.
pub fn build_reconciler(client: Client, config: &OperatorConfig) -> Reconciler {
    let settings = config.settings.clone();
    let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let registry = default_registry(api.clone(), settings.selection_seed);
    let prober = NetworkProber::new(settings.probe_timeout)
        .with_executor(Arc::new(KubePodExecutor::new(client)));
    let safety = SafetyEngine::new(
        api.clone(),
        Arc::new(prober),
        metric_source(&config.metrics, &settings),
    )
    .with_protected_namespaces(settings.protected_namespaces.clone())
    .with_retry_interval(settings.probe_retry_interval);

    let mut reconciler = Reconciler::new(api, Arc::new(registry), safety, settings);
    reconciler.add_event_sink(Arc::new(TracingEventSink));
    reconciler
}

pub fn to_action(action: ReconcileAction) -> Action {
    match action {
        ReconcileAction::RequeueNow => Action::requeue(Duration::ZERO),
        ReconcileAction::RequeueAfter(after) => Action::requeue(after),
        ReconcileAction::AwaitChange => Action::await_change(),
    }
}

/// Conflicts retry fast, other transient failures after a short pause.
pub fn backoff(error: &ChaosError, settings: &ControllerSettings) -> Duration {
    match error {
        ChaosError::Conflict(_) => settings.conflict_requeue,
        e if e.is_transient() => settings.transient_requeue,
        _ => settings.error_requeue,
    }
}

pub async fn reconcile(
    experiment: Arc<ChaosExperiment>,
    ctx: Arc<Context>,
) -> Result<Action, ChaosError> {
    let action = ctx.reconciler.reconcile(&experiment.key()).await?;
    Ok(to_action(action))
}

pub fn error_policy(experiment: Arc<ChaosExperiment>, error: &ChaosError, ctx: Arc<Context>) -> Action {
    let delay = backoff(error, ctx.reconciler.settings());
    if error.is_transient() {
        tracing::debug!(
            experiment = %experiment.name_any(),
            ?delay,
            error = %error,
            "Transient error, retrying"
        );
    } else {
        tracing::error!(
            experiment = %experiment.name_any(),
            ?delay,
            error = %error,
            "Reconciliation failed"
        );
    }
    Action::requeue(delay)
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let client = create_client(&config.kubernetes).await?;
    let experiments: Api<ChaosExperiment> = match config.kubernetes.watch_namespace {
        Some(ref ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    experiments
        .list(&ListParams::default().limit(1))
        .await
        .context("ChaosExperiment CRD is not installed, apply the output of `chaos crd` first")?;

    let ctx = Arc::new(Context {
        reconciler: build_reconciler(client, &config),
    });

    tracing::info!(
        namespace = config.kubernetes.watch_namespace.as_deref().unwrap_or("*"),
        concurrency = config.settings.max_concurrent,
        protected_namespaces = ?ctx.reconciler.settings().protected_namespaces,
        "Starting ChaosExperiment controller"
    );

    Controller::new(experiments, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(config.settings.max_concurrent))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((experiment, action)) => {
                    tracing::debug!(experiment = %experiment, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Controller stopped");
    Ok(())
}
