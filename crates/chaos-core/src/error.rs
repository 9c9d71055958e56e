use thiserror::Error;

use crate::experiment::ExperimentPhase;

#[derive(Error, Debug)]
pub enum ChaosError {
    /// Malformed duration, bad strategy parameter or an invalid spec field.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Target not found: {kind} {namespace}/{name}")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("No matching resources found for target criteria: {0}")]
    NoMatch(String),

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Unsupported target type: {0}")]
    UnsupportedTargetType(String),

    #[error("Unsupported chaos type: {0}")]
    UnsupportedChaosType(String),

    #[error("No injector registered for chaos type: {0}")]
    NoInjectorRegistered(String),

    #[error("Conflicting write on {0}: object has been modified")]
    Conflict(String),

    #[error("{0}")]
    SafetyViolation(String),

    #[error("Cluster API unavailable: {0}")]
    TransientApi(String),

    #[error("Illegal phase transition {from:?} -> {to}")]
    InvalidTransition {
        from: Option<ExperimentPhase>,
        to: ExperimentPhase,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChaosError {
    /// Errors that are recovered by re-running the reconciliation pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientApi(_) | Self::Conflict(_))
    }

    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

pub type ChaosResult<T> = Result<T, ChaosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChaosError::TransientApi("timeout".into()).is_transient());
        assert!(ChaosError::Conflict("default/exp".into()).is_transient());
        assert!(!ChaosError::Validation("bad".into()).is_transient());
        assert!(!ChaosError::SafetyViolation("probe".into()).is_transient());
        assert!(!ChaosError::not_found("Pod", "default", "web-0").is_transient());
    }

    #[test]
    fn not_found_message_names_the_target() {
        let err = ChaosError::not_found("Pod", "default", "non-existent-pod");
        assert_eq!(
            err.to_string(),
            "Target not found: Pod default/non-existent-pod"
        );
    }
}
