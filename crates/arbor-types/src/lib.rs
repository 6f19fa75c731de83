//! Shared types and errors for the Arbor execution core.
//!
//! This crate provides the vocabulary every other Arbor crate speaks:
//! - `ArborError`: unified error taxonomy
//! - `Ambiance` / `Level`: immutable addressing inside one plan execution
//! - `Status` / `ExecutionMode`: node lifecycle and its transition table
//! - `NodeExecution`, `StepResponse`, `ExecutableResponse`: node runtime records
//! - `Interrupt`: tree-wide and node-scoped commands
//! - persisted bookkeeping records (fan-out cursors, execution input, outputs)

pub mod ambiance;
pub mod execution;
pub mod interrupt;
pub mod records;
pub mod status;

pub use ambiance::{Ambiance, Level, StepCategory, StepType};
pub use execution::{
    ChildSpec, ExecutableResponse, FailureInfo, FailureType, InterruptEffect, NodeExecution,
    StepResponse,
};
pub use interrupt::{Interrupt, InterruptConfig, InterruptState, InterruptType, IssuedBy};
pub use records::{
    ConcurrentChildInstance, ContextElement, ContextElementKind, ExecutionInputInstance,
    PlanExecution, SweepingOutput,
};
pub use status::{ExecutionMode, Status};

/// Unified error type for all Arbor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ArborError {
    // === Lookup Errors ===
    #[error("Node execution '{0}' not found")]
    NodeExecutionNotFound(String),

    #[error("Plan node '{node}' not found in plan '{plan}'")]
    PlanNodeNotFound { plan: String, node: String },

    #[error("Interrupt '{0}' not found")]
    InterruptNotFound(String),

    #[error("Execution input instance not found for node execution '{0}'")]
    InputInstanceNotFound(String),

    #[error("Plan execution '{0}' not found")]
    PlanExecutionNotFound(String),

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Some fields are not valid: {fields:?}")]
    InvalidInputFields { fields: Vec<String> },

    #[error("{message}")]
    ConcurrencyLimitExceeded { limit: u64, message: String },

    // === Infrastructure Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Handler '{step_type}' failed on node '{node}': {message}")]
    HandlerError {
        step_type: String,
        node: String,
        message: String,
    },

    #[error("License lookup failed for account '{account}': {message}")]
    LicenseUnavailable { account: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl ArborError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArborError::Store(_) | ArborError::LicenseUnavailable { .. } | ArborError::Io(_)
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArborError::InvalidRequest(_)
                | ArborError::InvalidInputFields { .. }
                | ArborError::ConcurrencyLimitExceeded { .. }
        )
    }

    /// Maps the error to an HTTP status code for an API layer.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ArborError::NodeExecutionNotFound(_)
            | ArborError::PlanNodeNotFound { .. }
            | ArborError::InterruptNotFound(_)
            | ArborError::InputInstanceNotFound(_)
            | ArborError::PlanExecutionNotFound(_) => Some(404),
            ArborError::InvalidRequest(_)
            | ArborError::InvalidInputFields { .. }
            | ArborError::ConcurrencyLimitExceeded { .. } => Some(400),
            ArborError::Store(_) | ArborError::LicenseUnavailable { .. } => Some(503),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, ArborError>`.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Current wall-clock time in epoch milliseconds, the unit every record uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_node_not_found() {
        let err = ArborError::NodeExecutionNotFound("ne-1".into());
        assert_eq!(err.to_string(), "Node execution 'ne-1' not found");
    }

    #[test]
    fn error_display_plan_node_not_found() {
        let err = ArborError::PlanNodeNotFound {
            plan: "p1".into(),
            node: "build".into(),
        };
        assert_eq!(err.to_string(), "Plan node 'build' not found in plan 'p1'");
    }

    #[test]
    fn error_display_invalid_input_fields_lists_every_path() {
        let err = ArborError::InvalidInputFields {
            fields: vec!["pipeline.variables.a".into(), "pipeline.timeout".into()],
        };
        assert_eq!(
            err.to_string(),
            "Some fields are not valid: [\"pipeline.variables.a\", \"pipeline.timeout\"]"
        );
    }

    #[test]
    fn error_display_concurrency_limit_is_message_only() {
        let err = ArborError::ConcurrencyLimitExceeded {
            limit: 20,
            message: "Trying to run more than 20 concurrent stages/steps".into(),
        };
        assert_eq!(
            err.to_string(),
            "Trying to run more than 20 concurrent stages/steps"
        );
    }

    #[test]
    fn error_display_handler_error() {
        let err = ArborError::HandlerError {
            step_type: "task".into(),
            node: "deploy".into(),
            message: "executor offline".into(),
        };
        assert_eq!(
            err.to_string(),
            "Handler 'task' failed on node 'deploy': executor offline"
        );
    }

    #[test]
    fn error_display_other() {
        let err = ArborError::Other("something went wrong".into());
        assert_eq!(err.to_string(), "something went wrong");
    }

    #[test]
    fn retryable_store_error() {
        assert!(ArborError::Store("connection reset".into()).is_retryable());
        assert!(!ArborError::Store("connection reset".into()).is_terminal());
    }

    #[test]
    fn retryable_license_unavailable() {
        let err = ArborError::LicenseUnavailable {
            account: "acc".into(),
            message: "timeout".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn terminal_validation_errors() {
        assert!(ArborError::InvalidRequest("bad".into()).is_terminal());
        assert!(ArborError::InvalidInputFields { fields: vec![] }.is_terminal());
        assert!(ArborError::ConcurrencyLimitExceeded {
            limit: 1,
            message: String::new(),
        }
        .is_terminal());
    }

    #[test]
    fn not_found_is_neither_retryable_nor_terminal() {
        let err = ArborError::InterruptNotFound("i1".into());
        assert!(!err.is_retryable());
        assert!(!err.is_terminal());
    }

    #[test]
    fn http_status_not_found_404() {
        assert_eq!(
            ArborError::PlanExecutionNotFound("pe".into()).http_status(),
            Some(404)
        );
    }

    #[test]
    fn http_status_validation_400() {
        assert_eq!(ArborError::InvalidRequest("x".into()).http_status(), Some(400));
    }

    #[test]
    fn http_status_store_503() {
        assert_eq!(ArborError::Store("down".into()).http_status(), Some(503));
    }

    #[test]
    fn http_status_none_for_other() {
        assert_eq!(ArborError::Other("x".into()).http_status(), None);
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad").unwrap_err();
        let err: ArborError = json_err.into();
        assert!(matches!(err, ArborError::Json(_)));
    }

    #[test]
    fn from_serde_yaml_error() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("a: [1, 2").unwrap_err();
        let err: ArborError = yaml_err.into();
        assert!(matches!(err, ArborError::Yaml(_)));
    }

    #[test]
    fn result_alias_err() {
        fn example() -> Result<()> {
            Err(ArborError::Other("fail".into()))
        }
        assert!(example().is_err());
    }
}
