use thiserror::Error;

use crate::types::TopicId;

#[derive(Debug, Error)]
pub enum SwitchyardError {
    // Build errors
    #[error("Topic already has a subscribed agent: {0}")]
    DuplicateTopic(String),

    #[error("Unknown step type '{step_type}' in agent '{agent}'")]
    UnknownStepType { agent: String, step_type: String },

    #[error("Malformed route #{index} in agent '{agent}': {reason}")]
    MalformedRoute {
        agent: String,
        index: usize,
        reason: String,
    },

    #[error("Invalid config for step type '{step_type}': {reason}")]
    InvalidStepConfig { step_type: String, reason: String },

    // Dispatch errors
    #[error("Unrouted topic: {0}")]
    UnroutedTopic(TopicId),

    #[error("Publish cancelled")]
    Cancelled,

    #[error("Hop limit ({limit}) exceeded publishing to {topic}")]
    HopLimitExceeded { topic: TopicId, limit: usize },

    // Pipeline errors
    #[error("Missing input '{path}' for step '{step}' in agent '{agent}'")]
    MissingInput {
        agent: String,
        step: String,
        path: String,
    },

    #[error("Step '{step}' failed in agent '{agent}': {message}")]
    StepExecution {
        agent: String,
        step: String,
        message: String,
    },

    #[error("Step '{step}' in agent '{agent}' did not produce declared output '{output}'")]
    MissingOutput {
        agent: String,
        step: String,
        output: String,
    },

    // Expression errors
    #[error("Expression error in `{expr}`: {reason}")]
    Expression { expr: String, reason: String },

    // Completion errors
    #[error("Timed out waiting for completion on {0}")]
    CompletionTimeout(TopicId),

    #[error("Completion abandoned for {0}")]
    CompletionAbandoned(TopicId),

    #[error("Invocation task failed: {0}")]
    Join(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SwitchyardError {
    /// Errors that can only arise while compiling agent definitions.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTopic(_)
                | Self::UnknownStepType { .. }
                | Self::MalformedRoute { .. }
                | Self::InvalidStepConfig { .. }
        )
    }

    pub fn expression(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

/// Failure reported by a step executor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// Hint for supervisory layers; the runtime never retries on its own.
    pub retryable: bool,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_are_classified() {
        assert!(SwitchyardError::DuplicateTopic("a".into()).is_build_error());
        assert!(SwitchyardError::UnknownStepType {
            agent: "a".into(),
            step_type: "llm".into()
        }
        .is_build_error());
        assert!(!SwitchyardError::UnroutedTopic(TopicId::new("a", "wf")).is_build_error());
        assert!(!SwitchyardError::Cancelled.is_build_error());
    }

    #[test]
    fn unrouted_topic_message_names_the_identity() {
        let err = SwitchyardError::UnroutedTopic(TopicId::new("missing", "wf-9"));
        assert_eq!(err.to_string(), "Unrouted topic: missing@wf-9");
    }

    #[test]
    fn step_error_constructors() {
        assert!(!StepError::new("bad").retryable);
        assert!(StepError::transient("flaky").retryable);
        assert_eq!(StepError::new("boom").to_string(), "boom");
    }
}
