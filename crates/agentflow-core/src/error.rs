use thiserror::Error;

use crate::workflow::Violation;

#[derive(Debug, Error)]
pub enum FlowError {
    // Workflow errors
    #[error("Workflow validation failed with {} violation(s)", .0.len())]
    Validation(Vec<Violation>),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow parse error: {0}")]
    WorkflowParse(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled")]
    Cancelled,

    // Node errors
    #[error("Missing required input {port} for node {node}")]
    InputResolution { node: String, port: String },

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Agent invocation failed: {capability}: {message}")]
    AgentInvocation {
        capability: String,
        message: String,
        retryable: bool,
    },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    Timeout { node: String, timeout_secs: u64 },

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // TOML errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FlowError {
    /// Whether the recovery layer may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlowError::Timeout { .. } => true,
            FlowError::AgentInvocation { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = FlowError::Timeout {
            node: "a".into(),
            timeout_secs: 5,
        };
        assert!(timeout.is_retryable());

        let transient = FlowError::AgentInvocation {
            capability: "agent".into(),
            message: "rate limited".into(),
            retryable: true,
        };
        assert!(transient.is_retryable());

        assert!(!FlowError::Validation(vec![]).is_retryable());
        assert!(!FlowError::InputResolution {
            node: "b".into(),
            port: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_validation_message_counts_violations() {
        let err = FlowError::Validation(vec![
            Violation::CycleDetected {
                nodes: vec!["a".into(), "b".into()],
            },
            Violation::UnknownNode {
                edge: 0,
                node: "z".into(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Workflow validation failed with 2 violation(s)"
        );
    }
}
