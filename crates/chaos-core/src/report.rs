use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::experiment::{ChaosExperiment, TargetResourceRecord};
use crate::status::Condition;

/// Human-readable summary of one experiment.
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    pub name: String,
    pub namespace: String,
    pub chaos_type: String,
    pub declared_duration: String,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub targets: Vec<TargetResourceRecord>,
    pub conditions: Vec<Condition>,
    pub failure_reason: Option<String>,
}

impl ExperimentReport {
    pub fn from_experiment(experiment: &ChaosExperiment) -> Self {
        let key = experiment.key();
        let status = experiment.status.clone().unwrap_or_default();
        Self {
            name: key.name,
            namespace: key.namespace,
            chaos_type: experiment.spec.chaos_type.clone(),
            declared_duration: experiment.spec.duration.clone(),
            phase: status
                .phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "New".to_string()),
            started_at: status.start_time,
            ended_at: status.end_time,
            targets: status.target_resources,
            conditions: status.conditions,
            failure_reason: status.failure_reason,
        }
    }

    /// Wall time from acceptance to the terminal phase, if both are known.
    pub fn elapsed(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        (end - start).to_std().ok()
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    if total_secs >= 3600 {
        format!("{}h {}m {}s", total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60)
    } else if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else {
        let millis = d.as_millis();
        if millis < 1000 {
            format!("{millis}ms")
        } else {
            format!("{}.{}s", total_secs, d.subsec_millis() / 100)
        }
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bar = "=".repeat(72);
        let thin = "-".repeat(72);

        writeln!(f, "\n{bar}")?;
        writeln!(f, "  EXPERIMENT REPORT")?;
        writeln!(f, "{bar}\n")?;

        writeln!(f, "  Name:      {}/{}", self.namespace, self.name)?;
        writeln!(f, "  Type:      {}", self.chaos_type)?;
        writeln!(f, "  Duration:  {}", self.declared_duration)?;
        writeln!(f, "  Phase:     {}", self.phase)?;
        if let Some(ref reason) = self.failure_reason {
            writeln!(f, "  Reason:    {reason}")?;
        }

        writeln!(f, "\n{thin}")?;
        writeln!(f, "  TARGETS ({})", self.targets.len())?;
        writeln!(f, "{thin}\n")?;
        if self.targets.is_empty() {
            writeln!(f, "  (none)")?;
        } else {
            writeln!(f, "  {:<22} {:<30} {}", "KIND", "NAME", "STATUS")?;
            for t in &self.targets {
                let name = match t.namespace.as_deref() {
                    Some(ns) => format!("{ns}/{}", t.name),
                    None => t.name.clone(),
                };
                let status = t
                    .status
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|| "-".to_string());
                writeln!(f, "  {:<22} {:<30} {}", t.kind.as_str(), name, status)?;
            }
        }

        writeln!(f, "\n{thin}")?;
        writeln!(f, "  CONDITIONS ({})", self.conditions.len())?;
        writeln!(f, "{thin}\n")?;
        if self.conditions.is_empty() {
            writeln!(f, "  (none)")?;
        } else {
            for c in &self.conditions {
                writeln!(
                    f,
                    "  {}  {:<20} {:<20}",
                    c.last_transition_time.format("%H:%M:%S"),
                    c.type_,
                    c.reason.as_deref().unwrap_or("-"),
                )?;
                if let Some(ref message) = c.message {
                    writeln!(f, "            -> {message}")?;
                }
            }
        }

        writeln!(f, "\n{thin}")?;
        writeln!(f, "  TIMELINE")?;
        writeln!(f, "{thin}\n")?;
        writeln!(f, "  Started:   {}", format_time(self.started_at))?;
        writeln!(f, "  Ended:     {}", format_time(self.ended_at))?;
        if let Some(elapsed) = self.elapsed() {
            writeln!(f, "  Total:     {}", format_duration(elapsed))?;
        }

        writeln!(f, "\n{bar}")?;

        Ok(())
    }
}
