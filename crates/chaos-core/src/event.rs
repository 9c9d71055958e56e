use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::experiment::{ExperimentKey, ExperimentPhase};

#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentEvent {
    TargetsResolved {
        experiment: ExperimentKey,
        count: usize,
    },
    PhaseChanged {
        experiment: ExperimentKey,
        from: Option<ExperimentPhase>,
        to: ExperimentPhase,
        at: DateTime<Utc>,
    },
    ChaosInjected {
        experiment: ExperimentKey,
        chaos_type: String,
    },
    ChaosRemoved {
        experiment: ExperimentKey,
        success: bool,
    },
    SafetyRollback {
        experiment: ExperimentKey,
        reason: String,
    },
    FinalizerReleased {
        experiment: ExperimentKey,
    },
}

/// Sink for experiment events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExperimentEvent);
}

/// Forwards events to a receiver.
pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::UnboundedSender<ExperimentEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ExperimentEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: ExperimentEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: ExperimentEvent) {
        tracing::info!(?event, "experiment_event");
    }
}
