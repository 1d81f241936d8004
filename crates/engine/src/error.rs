//! Error types for workflow execution

use thiserror::Error;

use crate::report::StepStatus;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Target not found: {locator} (waited {waited_ms} ms)")]
    TargetNotFound { locator: String, waited_ms: u64 },

    #[error("Ambiguous target: {locator} matched {count} elements and no index was declared")]
    AmbiguousTarget { locator: String, count: usize },

    #[error("Action '{action}' not supported by target: {reason}")]
    ActionError { action: String, reason: String },

    #[error("Timeout after {timeout_ms} ms waiting for: {condition}")]
    ConditionTimeout { condition: String, timeout_ms: u64 },

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Scenario budget of {budget_ms} ms exhausted")]
    ScenarioTimeout { budget_ms: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("Invalid locator '{input}': {reason}")]
    InvalidLocator { input: String, reason: String },

    #[error("Invalid URL pattern '{0}'")]
    InvalidPattern(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Browser driver unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ActionError {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Status recorded for the step that raised this error.
    pub fn step_status(&self) -> StepStatus {
        match self {
            EngineError::TargetNotFound { .. }
            | EngineError::ConditionTimeout { .. }
            | EngineError::ScenarioTimeout { .. }
            | EngineError::Cancelled => StepStatus::TimedOut,
            _ => StepStatus::Failed,
        }
    }

    /// Errors after which the session cannot be driven any further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::SessionLost(_)
                | EngineError::ScenarioTimeout { .. }
                | EngineError::Cancelled
        )
    }

    /// Short machine-readable tag used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::TargetNotFound { .. } => "target_not_found",
            EngineError::AmbiguousTarget { .. } => "ambiguous_target",
            EngineError::ActionError { .. } => "action_error",
            EngineError::ConditionTimeout { .. } => "condition_timeout",
            EngineError::SessionLost(_) => "session_lost",
            EngineError::ScenarioTimeout { .. } => "scenario_timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::Transport(_) => "transport",
            EngineError::InvalidScenario(_)
            | EngineError::InvalidLocator { .. }
            | EngineError::InvalidPattern(_) => "invalid_scenario",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::BrowserUnavailable(_) => "browser_unavailable",
            EngineError::Io(_)
            | EngineError::Json(_)
            | EngineError::Yaml(_)
            | EngineError::Toml(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_map_to_timed_out() {
        let err = EngineError::TargetNotFound {
            locator: "text=Sign in".into(),
            waited_ms: 5000,
        };
        assert_eq!(err.step_status(), StepStatus::TimedOut);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_session_lost_is_fatal() {
        let err = EngineError::SessionLost("driver exited".into());
        assert_eq!(err.step_status(), StepStatus::Failed);
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "session_lost");
    }
}
