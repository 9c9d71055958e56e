//! The experiment lifecycle.
//!
//! Every pass starts from the stored experiment and moves it at most one
//! phase forward:
//!
//! ```text
//!   (new) -> Pending -> Running -> Completed
//!               |          |
//!               +----------+----> Failed
//! ```
//!
//! Deletion is checked before the phase switch. While the experiment holds
//! its finalizer, a Running experiment, or a Pending one with resolved
//! targets, is rolled back before the finalizer is released, so chaos never
//! outlives its declaration. Long waits are returned
//! as [`ReconcileAction::RequeueAfter`] instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::api::ClusterApi;
use crate::clock::{Clock, SystemClock};
use crate::config::ControllerSettings;
use crate::error::{ChaosError, ChaosResult};
use crate::event::{EventSink, ExperimentEvent};
use crate::experiment::{
    ChaosExperiment, ChaosExperimentStatus, ChaosType, ExperimentKey, ExperimentPhase, TargetKind,
    TargetState, EXPERIMENT_FINALIZER,
};
use crate::injector::{Injector, InjectorRegistry};
use crate::safety::{SafetyDecision, SafetyEngine};
use crate::schedule::injection_not_before;
use crate::status::{
    Condition, ConditionStatus, CONDITION_CHAOS_INJECTED, CONDITION_CHAOS_REMOVED,
    CONDITION_SAFETY_VIOLATED, CONDITION_TARGETS_RESOLVED, CONDITION_WAITING_FOR_SCHEDULE,
};
use crate::target::TargetResolver;

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    RequeueNow,
    RequeueAfter(Duration),
    AwaitChange,
}

pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    registry: Arc<InjectorRegistry>,
    resolver: TargetResolver,
    safety: SafetyEngine,
    settings: ControllerSettings,
    clock: Arc<dyn Clock>,
    event_sinks: Vec<Arc<dyn EventSink>>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        registry: Arc<InjectorRegistry>,
        safety: SafetyEngine,
        settings: ControllerSettings,
    ) -> Self {
        let resolver = TargetResolver::new(api.clone(), settings.selection_seed);
        Self {
            api,
            registry,
            resolver,
            safety,
            settings,
            clock: Arc::new(SystemClock),
            event_sinks: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sinks.push(sink);
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    async fn emit(&self, event: ExperimentEvent) {
        for sink in &self.event_sinks {
            sink.emit(event.clone()).await;
        }
    }

    #[instrument(skip_all, fields(experiment = %key))]
    pub async fn reconcile(&self, key: &ExperimentKey) -> ChaosResult<ReconcileAction> {
        let Some(experiment) = self.api.get_experiment(key).await? else {
            debug!("Experiment no longer exists");
            return Ok(ReconcileAction::AwaitChange);
        };

        if experiment.is_deleting() {
            return self.handle_deletion(experiment).await;
        }

        let phase = experiment.phase();
        if !experiment.has_finalizer() && !phase.is_some_and(ExperimentPhase::is_terminal) {
            self.add_finalizer(experiment).await?;
            return Ok(ReconcileAction::RequeueNow);
        }

        match phase {
            None => self.initialize(experiment).await,
            Some(ExperimentPhase::Pending) => self.start(experiment).await,
            Some(ExperimentPhase::Running) => self.monitor(experiment).await,
            Some(ExperimentPhase::Completed | ExperimentPhase::Failed) => {
                Ok(ReconcileAction::AwaitChange)
            }
        }
    }

    async fn add_finalizer(&self, mut experiment: ChaosExperiment) -> ChaosResult<()> {
        experiment
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(EXPERIMENT_FINALIZER.to_string());
        self.api.update_experiment(&experiment).await?;
        debug!("Added cleanup finalizer");
        Ok(())
    }

    async fn handle_deletion(
        &self,
        mut experiment: ChaosExperiment,
    ) -> ChaosResult<ReconcileAction> {
        if !experiment.has_finalizer() {
            return Ok(ReconcileAction::AwaitChange);
        }
        let key = experiment.key();

        // A Pending experiment with targets may have injected before its
        // Running status write was lost.
        let phase = experiment.phase();
        let chaos_possible = match phase {
            Some(ExperimentPhase::Running) => true,
            Some(ExperimentPhase::Pending) => !experiment.target_resources().is_empty(),
            _ => false,
        };
        let injector = if chaos_possible {
            match self.injector_for(&experiment) {
                Ok(injector) => Some(injector),
                Err(e) => {
                    warn!(error = %e, "No injector for deleted experiment, nothing to remove");
                    None
                }
            }
        } else {
            None
        };

        if let Some(injector) = injector {
            info!(phase = ?phase, "Experiment deleted with chaos possibly active, removing it");
            if let Err(e) = injector
                .cleanup(&experiment, experiment.target_resources())
                .await
            {
                error!(error = %e, "Cleanup failed, keeping finalizer");
                return Err(e);
            }
            self.emit(ExperimentEvent::ChaosRemoved {
                experiment: key.clone(),
                success: true,
            })
            .await;
        }

        if let Some(finalizers) = experiment.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != EXPERIMENT_FINALIZER);
        }
        self.api.update_experiment(&experiment).await?;
        info!("Released cleanup finalizer");
        self.emit(ExperimentEvent::FinalizerReleased { experiment: key })
            .await;
        Ok(ReconcileAction::AwaitChange)
    }

    /// New -> Pending, then resolve targets.
    async fn initialize(&self, experiment: ChaosExperiment) -> ChaosResult<ReconcileAction> {
        let mut status = experiment.status.clone().unwrap_or_default();
        status.transition(ExperimentPhase::Pending)?;
        status.start_time = Some(self.clock.now());
        let experiment = self.write_status(experiment, status).await?;
        info!("Experiment accepted");

        self.resolve_targets(experiment).await
    }

    async fn resolve_targets(&self, experiment: ChaosExperiment) -> ChaosResult<ReconcileAction> {
        let key = experiment.key();
        let resolved = self
            .resolver
            .resolve(&experiment.spec.target, &key.namespace)
            .await;

        match resolved {
            Ok(targets) => {
                let count = targets.len();
                let mut status = experiment.status.clone().unwrap_or_default();
                status.set_targets(targets);
                status.push_condition(Condition::new(
                    CONDITION_TARGETS_RESOLVED,
                    ConditionStatus::True,
                    "TargetsResolved",
                    format!("Resolved {count} target(s)"),
                    self.clock.now(),
                ));
                self.write_status(experiment, status).await?;
                info!(count, "Resolved experiment targets");
                self.emit(ExperimentEvent::TargetsResolved {
                    experiment: key,
                    count,
                })
                .await;
                Ok(ReconcileAction::RequeueNow)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                warn!(error = %e, "Target resolution failed");
                self.fail(experiment, format!("Failed to identify targets: {e}"), None)
                    .await
            }
        }
    }

    /// Pending -> Running: schedule gate, safety pre-check, injection.
    async fn start(&self, experiment: ChaosExperiment) -> ChaosResult<ReconcileAction> {
        if experiment.target_resources().is_empty() {
            return self.resolve_targets(experiment).await;
        }

        let now = self.clock.now();
        let since = experiment
            .status
            .as_ref()
            .and_then(|s| s.start_time)
            .unwrap_or(now);
        match injection_not_before(experiment.spec.schedule.as_ref(), since) {
            Err(e) => return self.fail(experiment, e.to_string(), None).await,
            Ok(Some(at)) if at > now => return self.wait_for_schedule(experiment, at).await,
            Ok(_) => {}
        }

        let decision = self.safety.evaluate(&experiment).await;
        match decision {
            Ok(SafetyDecision::Proceed) => {}
            Ok(SafetyDecision::Rollback(reason)) => {
                warn!(%reason, "Safety pre-check failed, not injecting");
                self.emit(ExperimentEvent::SafetyRollback {
                    experiment: experiment.key(),
                    reason: reason.clone(),
                })
                .await;
                let condition = self.safety_condition(&reason);
                return self.fail(experiment, reason, Some(condition)).await;
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fail(experiment, e.to_string(), None).await,
        }

        let injector = match self.injector_for(&experiment) {
            Ok(injector) => injector,
            Err(e) => return self.fail(experiment, e.to_string(), None).await,
        };
        if let Err(e) = injector.validate_params(&experiment.spec.parameters) {
            return self.fail(experiment, e.to_string(), None).await;
        }

        let targets = experiment.target_resources();
        let injected = injector.inject(&experiment, targets).await;
        match injected {
            Ok(()) => {}
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                error!(error = %e, "Chaos injection failed");
                if let Err(cleanup_err) = injector.cleanup(&experiment, targets).await {
                    warn!(error = %cleanup_err, "Best-effort cleanup after failed injection also failed");
                }
                return self
                    .fail(experiment, format!("Failed to inject chaos: {e}"), None)
                    .await;
            }
        }

        let chaos_type = experiment.spec.chaos_type.clone();
        let mut status = experiment.status.clone().unwrap_or_default();
        status.transition(ExperimentPhase::Running)?;
        status.mark_targets(TargetState::Affected);
        status.push_condition(Condition::new(
            CONDITION_CHAOS_INJECTED,
            ConditionStatus::True,
            "ChaosStarted",
            format!("Started chaos experiment of type {chaos_type}"),
            self.clock.now(),
        ));
        let experiment = self.write_status(experiment, status).await?;
        info!(chaos_type = %chaos_type, "Chaos injected");
        self.emit(ExperimentEvent::ChaosInjected {
            experiment: experiment.key(),
            chaos_type,
        })
        .await;

        let window = experiment.spec.duration_or(self.settings.default_duration);
        Ok(ReconcileAction::RequeueAfter(
            window.min(self.settings.monitor_interval),
        ))
    }

    async fn wait_for_schedule(
        &self,
        experiment: ChaosExperiment,
        at: chrono::DateTime<chrono::Utc>,
    ) -> ChaosResult<ReconcileAction> {
        let now = self.clock.now();
        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
        let already_noted = experiment
            .status
            .as_ref()
            .and_then(|s| s.latest_condition(CONDITION_WAITING_FOR_SCHEDULE))
            .is_some();
        if !already_noted {
            let mut status = experiment.status.clone().unwrap_or_default();
            status.push_condition(Condition::new(
                CONDITION_WAITING_FOR_SCHEDULE,
                ConditionStatus::True,
                "CronScheduled",
                format!("Waiting for cron schedule, next run at {}", at.to_rfc3339()),
                now,
            ));
            self.write_status(experiment, status).await?;
        }
        debug!(wait = ?wait, "Injection held back by cron schedule");
        Ok(ReconcileAction::RequeueAfter(wait))
    }

    /// Running: auto-rollback, expiry, and the PodFailure end state.
    async fn monitor(&self, experiment: ChaosExperiment) -> ChaosResult<ReconcileAction> {
        let injector = self.injector_for(&experiment)?;

        if experiment.spec.auto_rollback() {
            match self.safety.evaluate(&experiment).await {
                Ok(SafetyDecision::Proceed) => {}
                Ok(SafetyDecision::Rollback(reason)) => {
                    return self.roll_back(experiment, injector.as_ref(), reason).await;
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    let reason = format!("Safety evaluation failed: {e}");
                    return self.roll_back(experiment, injector.as_ref(), reason).await;
                }
            }
        }

        let now = self.clock.now();
        let window = experiment.spec.duration_or(self.settings.default_duration);
        let injected_at = experiment
            .status
            .as_ref()
            .and_then(ChaosExperimentStatus::injected_at)
            .unwrap_or(now);
        let elapsed = (now - injected_at).to_std().unwrap_or(Duration::ZERO);

        if elapsed >= window {
            injector
                .cleanup(&experiment, experiment.target_resources())
                .await?;
            return self
                .complete(
                    experiment,
                    "ExperimentCompleted",
                    "Chaos experiment completed successfully",
                )
                .await;
        }

        if experiment.spec.chaos_type().ok() == Some(ChaosType::PodFailure)
            && self.pod_targets_gone(&experiment).await?
        {
            return self
                .complete(
                    experiment,
                    "TargetTerminated",
                    "Target pods were terminated as expected",
                )
                .await;
        }

        let remaining = window - elapsed;
        debug!(remaining = ?remaining, "Chaos still active");
        Ok(ReconcileAction::RequeueAfter(
            remaining.min(self.settings.monitor_interval),
        ))
    }

    /// Whether every Pod target has disappeared or been replaced.
    async fn pod_targets_gone(&self, experiment: &ChaosExperiment) -> ChaosResult<bool> {
        let pods: Vec<_> = experiment
            .target_resources()
            .iter()
            .filter(|t| t.kind == TargetKind::Pod)
            .collect();
        if pods.is_empty() {
            return Ok(false);
        }
        for pod in pods {
            let live = self
                .api
                .get(TargetKind::Pod, pod.namespace(), &pod.name)
                .await?;
            let replaced = match (&live, &pod.uid) {
                (Some(object), Some(uid)) => object.uid() != Some(uid.as_str()),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !replaced {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn roll_back(
        &self,
        experiment: ChaosExperiment,
        injector: &dyn Injector,
        reason: String,
    ) -> ChaosResult<ReconcileAction> {
        warn!(%reason, "Safety violation while running, rolling back");
        self.emit(ExperimentEvent::SafetyRollback {
            experiment: experiment.key(),
            reason: reason.clone(),
        })
        .await;

        injector
            .cleanup(&experiment, experiment.target_resources())
            .await?;
        self.emit(ExperimentEvent::ChaosRemoved {
            experiment: experiment.key(),
            success: true,
        })
        .await;

        let now = self.clock.now();
        let mut status = experiment.status.clone().unwrap_or_default();
        status.mark_targets(TargetState::Restored);
        status.push_condition(self.safety_condition(&reason));
        status.push_condition(Condition::new(
            CONDITION_CHAOS_REMOVED,
            ConditionStatus::True,
            "AutoRollback",
            "Chaos removed after safety violation",
            now,
        ));
        status.fail(format!("Auto-rollback triggered: {reason}"), now)?;
        self.write_status(experiment, status).await?;
        Ok(ReconcileAction::AwaitChange)
    }

    async fn complete(
        &self,
        experiment: ChaosExperiment,
        reason: &str,
        message: &str,
    ) -> ChaosResult<ReconcileAction> {
        let now = self.clock.now();
        let key = experiment.key();
        let mut status = experiment.status.clone().unwrap_or_default();
        status.transition(ExperimentPhase::Completed)?;
        status.end_time = Some(now);
        status.mark_targets(TargetState::Restored);
        status.push_condition(Condition::new(
            CONDITION_CHAOS_REMOVED,
            ConditionStatus::True,
            reason,
            message,
            now,
        ));
        self.write_status(experiment, status).await?;
        info!(reason, "Experiment completed");
        self.emit(ExperimentEvent::ChaosRemoved {
            experiment: key,
            success: true,
        })
        .await;
        Ok(ReconcileAction::AwaitChange)
    }

    async fn fail(
        &self,
        experiment: ChaosExperiment,
        reason: String,
        condition: Option<Condition>,
    ) -> ChaosResult<ReconcileAction> {
        let mut status = experiment.status.clone().unwrap_or_default();
        if let Some(condition) = condition {
            status.push_condition(condition);
        }
        status.fail(reason.clone(), self.clock.now())?;
        self.write_status(experiment, status).await?;
        warn!(%reason, "Experiment failed");
        Ok(ReconcileAction::AwaitChange)
    }

    fn safety_condition(&self, reason: &str) -> Condition {
        Condition::new(
            CONDITION_SAFETY_VIOLATED,
            ConditionStatus::True,
            "SafetyCheckFailed",
            reason,
            self.clock.now(),
        )
    }

    fn injector_for(&self, experiment: &ChaosExperiment) -> ChaosResult<Arc<dyn Injector>> {
        self.registry.lookup(experiment.spec.chaos_type()?)
    }

    /// Persist `status`, publishing a phase change when there is one.
    async fn write_status(
        &self,
        mut experiment: ChaosExperiment,
        status: ChaosExperimentStatus,
    ) -> ChaosResult<ChaosExperiment> {
        let from = experiment.phase();
        let to = status.phase;
        experiment.status = Some(status);
        let updated = self.api.update_experiment_status(&experiment).await?;

        if let Some(to) = to.filter(|to| Some(*to) != from) {
            debug!(from = ?from, %to, "Phase changed");
            self.emit(ExperimentEvent::PhaseChanged {
                experiment: updated.key(),
                from,
                to,
                at: self.clock.now(),
            })
            .await;
        }
        Ok(updated)
    }
}

/// Re-run `reconcile` while it asks to be requeued immediately.
pub async fn reconcile_until_settled(
    reconciler: &Reconciler,
    key: &ExperimentKey,
    max_passes: usize,
) -> ChaosResult<ReconcileAction> {
    let mut action = ReconcileAction::RequeueNow;
    for _ in 0..max_passes {
        action = reconciler.reconcile(key).await?;
        if action != ReconcileAction::RequeueNow {
            break;
        }
    }
    if action == ReconcileAction::RequeueNow {
        return Err(ChaosError::Other(anyhow::anyhow!(
            "{key} still requeueing after {max_passes} passes"
        )));
    }
    Ok(action)
}
