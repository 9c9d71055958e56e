//! ChaosExperiment custom resource.
//!
//! The `spec` block is written by users and treated as immutable once admitted; the
//! status is owned exclusively by the reconciler. Enumerated spec fields
//! (`chaosType`, `target.targetType`, `target.mode`) travel as plain strings
//! and are parsed here, so an unknown value becomes a reportable failure on
//! the experiment rather than an object the controller cannot decode.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ChaosError, ChaosResult};
use crate::schedule::CronGate;
use crate::selector::LabelQuery;
use crate::status::Condition;

/// Finalizer held on every non-terminal experiment until rollback has run.
pub const EXPERIMENT_FINALIZER: &str = "chaos-agents.io/experiment-cleanup";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "chaos-agents.io",
    version = "v1alpha1",
    kind = "ChaosExperiment",
    plural = "chaosexperiments",
    shortname = "cex",
    status = "ChaosExperimentStatus",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.chaosType"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.targetType"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChaosExperimentSpec {
    /// What to break.
    pub target: TargetSpec,

    /// One of DiskFailure, NetworkLatency, PodFailure, StatefulSetScaling, ...
    pub chaos_type: String,

    /// How long chaos stays applied, e.g. "1h30m" or "45s".
    pub duration: String,

    /// Severity in [0.0, 1.0].
    #[serde(default)]
    pub intensity: f64,

    /// Strategy-specific options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetySpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Label query over `targetType` resources in `namespace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Exact resource name; takes precedence over `selector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Defaults to the experiment's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Defaults to StatefulSet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,

    /// One, All, Random, Percentage or Fixed. Defaults to All.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Percentage or count used with `mode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl TargetSpec {
    pub fn target_kind(&self) -> ChaosResult<TargetKind> {
        match non_empty(&self.target_type) {
            Some(t) => t.parse(),
            None => Ok(TargetKind::StatefulSet),
        }
    }

    pub fn selection(&self) -> ChaosResult<Selection> {
        let mode = match non_empty(&self.mode) {
            Some(m) => m.parse()?,
            None => SelectionMode::All,
        };
        Selection::from_mode(mode, non_empty(&self.value))
    }

    pub fn exact_name(&self) -> Option<&str> {
        non_empty(&self.name)
    }

    /// Target namespace, falling back to the experiment's own.
    pub fn namespace_or<'a>(&'a self, experiment_namespace: &'a str) -> &'a str {
        non_empty(&self.namespace).unwrap_or(experiment_namespace)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Cron expression; injection waits for its first fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    #[serde(default)]
    pub immediate: bool,

    #[serde(default)]
    pub once: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetySpec {
    /// Re-evaluate safety on every pass while Running and roll back on violation.
    #[serde(default)]
    pub auto_rollback: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pause_conditions: Vec<PauseConditionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_protections: Vec<ProtectionSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// httpGet, tcpSocket or exec.
    #[serde(rename = "type")]
    pub type_: String,

    /// Probe host for httpGet/tcpSocket; defaults to localhost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Consecutive failures before the check counts as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PauseConditionSpec {
    /// metric, alert or manual. Only metric conditions are evaluated.
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionSpec {
    /// Namespace, Label, Annotation or Name.
    #[serde(rename = "type")]
    pub type_: String,

    /// Label and Annotation rules accept `key` or `key=value`.
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChaosExperimentStatus {
    /// Absent until the reconciler first sees the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ExperimentPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Append-only observation log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Resolved once, then frozen.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_resources: Vec<TargetResourceRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ExperimentPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases only move forward; terminal phases are never left.
    pub fn can_transition(from: Option<Self>, to: Self) -> bool {
        match (from, to) {
            (None, Self::Pending) => true,
            (Some(Self::Pending), Self::Running | Self::Failed) => true,
            (Some(Self::Running), Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetResourceRecord {
    pub kind: TargetKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TargetState>,
}

impl TargetResourceRecord {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetState {
    Targeted,
    Affected,
    Restored,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    Pod,
    StatefulSet,
    Deployment,
    PersistentVolumeClaim,
    PersistentVolume,
    Service,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::PersistentVolume => "PersistentVolume",
            Self::Service => "Service",
        }
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, Self::PersistentVolume)
    }

    pub fn is_scalable(self) -> bool {
        matches!(self, Self::StatefulSet | Self::Deployment)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pod" => Ok(Self::Pod),
            "StatefulSet" => Ok(Self::StatefulSet),
            "Deployment" => Ok(Self::Deployment),
            "PersistentVolumeClaim" => Ok(Self::PersistentVolumeClaim),
            "PersistentVolume" => Ok(Self::PersistentVolume),
            "Service" => Ok(Self::Service),
            other => Err(ChaosError::UnsupportedTargetType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChaosType {
    DiskFailure,
    NetworkLatency,
    PodFailure,
    StatefulSetScaling,
    DatabaseConnectionDisruption,
    ResourcePressure,
    DataCorruption,
}

impl ChaosType {
    pub const ALL: [ChaosType; 7] = [
        Self::DiskFailure,
        Self::NetworkLatency,
        Self::PodFailure,
        Self::StatefulSetScaling,
        Self::DatabaseConnectionDisruption,
        Self::ResourcePressure,
        Self::DataCorruption,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiskFailure => "DiskFailure",
            Self::NetworkLatency => "NetworkLatency",
            Self::PodFailure => "PodFailure",
            Self::StatefulSetScaling => "StatefulSetScaling",
            Self::DatabaseConnectionDisruption => "DatabaseConnectionDisruption",
            Self::ResourcePressure => "ResourcePressure",
            Self::DataCorruption => "DataCorruption",
        }
    }
}

impl fmt::Display for ChaosType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChaosType {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ChaosError::UnsupportedChaosType(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionMode {
    One,
    All,
    Random,
    Percentage,
    Fixed,
}

impl FromStr for SelectionMode {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "One" => Ok(Self::One),
            "All" => Ok(Self::All),
            "Random" => Ok(Self::Random),
            "Percentage" => Ok(Self::Percentage),
            "Fixed" => Ok(Self::Fixed),
            other => Err(ChaosError::Validation(format!(
                "unknown target mode '{other}'"
            ))),
        }
    }
}

/// A selection mode with its value parsed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Selection {
    One,
    All,
    Random,
    Percentage(f64),
    Fixed(usize),
}

impl Selection {
    fn from_mode(mode: SelectionMode, value: Option<&str>) -> ChaosResult<Self> {
        match mode {
            SelectionMode::One => Ok(Self::One),
            SelectionMode::All => Ok(Self::All),
            SelectionMode::Random => Ok(Self::Random),
            SelectionMode::Percentage => {
                let raw = value.ok_or_else(|| {
                    ChaosError::Validation("mode Percentage requires a value".into())
                })?;
                let pct: f64 = raw.trim().trim_end_matches('%').parse().map_err(|_| {
                    ChaosError::Validation(format!("invalid percentage '{raw}'"))
                })?;
                if !(pct > 0.0 && pct <= 100.0) {
                    return Err(ChaosError::Validation(format!(
                        "percentage must be in (0, 100], got {pct}"
                    )));
                }
                Ok(Self::Percentage(pct))
            }
            SelectionMode::Fixed => {
                let raw = value.ok_or_else(|| {
                    ChaosError::Validation("mode Fixed requires a value".into())
                })?;
                let count: usize = raw.trim().parse().map_err(|_| {
                    ChaosError::Validation(format!("invalid fixed count '{raw}'"))
                })?;
                if count == 0 {
                    return Err(ChaosError::Validation(
                        "fixed count must be at least 1".into(),
                    ));
                }
                Ok(Self::Fixed(count))
            }
        }
    }
}

/// Parse an `([0-9]+h)?([0-9]+m)?([0-9]+s)?` duration. Units appear in
/// that order, each at most once.
pub fn parse_duration(raw: &str) -> ChaosResult<Duration> {
    let invalid = || ChaosError::Validation(format!("invalid duration '{raw}'"));
    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut last_rank = None;
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let (rank, unit_secs) = match c {
            'h' => (0, 3600),
            'm' => (1, 60),
            's' => (2, 1),
            _ => return Err(invalid()),
        };
        if digits.is_empty() || last_rank.is_some_and(|last| last >= rank) {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(unit_secs)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
        last_rank = Some(rank);
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

impl ChaosExperimentSpec {
    pub fn chaos_type(&self) -> ChaosResult<ChaosType> {
        self.chaos_type.parse()
    }

    /// The requested chaos window, or `fallback` when the duration does not parse.
    pub fn duration_or(&self, fallback: Duration) -> Duration {
        match parse_duration(&self.duration) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    duration = %self.duration,
                    error = %e,
                    fallback = ?fallback,
                    "Invalid duration, using fallback window"
                );
                fallback
            }
        }
    }

    pub fn auto_rollback(&self) -> bool {
        self.safety.as_ref().is_some_and(|s| s.auto_rollback)
    }

    /// Offline checks on the declaration. Duration problems are not fatal
    /// because the reconciler falls back to a default window.
    pub fn validate(&self) -> ChaosResult<()> {
        self.chaos_type()?;
        self.target.target_kind()?;
        self.target.selection()?;

        if !(0.0..=1.0).contains(&self.intensity) {
            return Err(ChaosError::Validation(format!(
                "intensity must be within [0, 1], got {}",
                self.intensity
            )));
        }

        match (&self.target.exact_name(), &self.target.selector) {
            (Some(_), _) => {}
            (None, Some(selector)) => {
                LabelQuery::from_selector(selector)?;
            }
            (None, None) => {
                return Err(ChaosError::Validation(
                    "target requires either a name or a selector".into(),
                ))
            }
        }

        if let Some(cron) = self.schedule.as_ref().and_then(|s| s.cron.as_deref()) {
            CronGate::parse(cron)?;
        }

        Ok(())
    }
}

/// Namespace/name identity of an experiment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExperimentKey {
    pub namespace: String,
    pub name: String,
}

impl ExperimentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ChaosExperiment {
    pub fn key(&self) -> ExperimentKey {
        ExperimentKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn phase(&self) -> Option<ExperimentPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn target_resources(&self) -> &[TargetResourceRecord] {
        self.status
            .as_ref()
            .map(|s| s.target_resources.as_slice())
            .unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == EXPERIMENT_FINALIZER)
    }
}
