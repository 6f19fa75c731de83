//! Node execution record and the responses steps hand back to the driver.

use serde::{Deserialize, Serialize};

use crate::ambiance::{Ambiance, StepType};
use crate::interrupt::{InterruptConfig, InterruptType};
use crate::records::ContextElement;
use crate::status::{ExecutionMode, Status};

pub const TIMEOUT_ENGINE_EXCEPTION: &str = "TIMEOUT_ENGINE_EXCEPTION";
pub const GENERAL_ERROR: &str = "GENERAL_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ApplicationFailure,
    TimeoutFailure,
    UnknownFailure,
}

/// Structured reason a node ended FAILED or EXPIRED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_message: String,
    pub failure_types: Vec<FailureType>,
    pub code: String,
    pub level: String,
}

impl FailureInfo {
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            failure_types: vec![FailureType::ApplicationFailure],
            code: GENERAL_ERROR.to_string(),
            level: "ERROR".to_string(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            failure_types: vec![FailureType::TimeoutFailure],
            code: TIMEOUT_ENGINE_EXCEPTION.to_string(),
            level: "ERROR".to_string(),
        }
    }
}

/// Terminal result a step (or an interrupt acting for it) declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
    /// Artifacts and variables the step publishes to later attempts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_elements: Vec<ContextElement>,
}

impl StepResponse {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcome: None,
            context_elements: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcome: None,
            context_elements: Vec::new(),
        }
    }

    pub fn with_outcome(mut self, outcome: serde_json::Value) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_context_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.context_elements = elements;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub child_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_metadata: Option<serde_json::Value>,
}

/// How a running node will complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async {
        callback_ids: Vec<String>,
    },
    Task {
        task_id: String,
    },
    Child {
        child_node_id: String,
    },
    Children {
        children: Vec<ChildSpec>,
        /// Zero means "use the admission-control ceiling".
        #[serde(default)]
        max_concurrency: u64,
        #[serde(default)]
        proceed_if_failed: bool,
    },
}

impl ExecutableResponse {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            ExecutableResponse::Sync => ExecutionMode::Sync,
            ExecutableResponse::Async { .. } => ExecutionMode::Async,
            ExecutableResponse::Task { .. } => ExecutionMode::Task,
            ExecutableResponse::Child { .. } => ExecutionMode::Child,
            ExecutableResponse::Children { .. } => ExecutionMode::Children,
        }
    }
}

/// One interrupt that touched a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub took_effect_at: i64,
    pub interrupt_config: InterruptConfig,
}

/// Durable runtime record of one plan node instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: String,
    pub ambiance: Ambiance,
    pub node_id: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub interrupt_histories: Vec<InterruptEffect>,
    #[serde(default)]
    pub retry_ids: Vec<String>,
    pub start_ts: i64,
    #[serde(default)]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub skip_graph_type: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// Callback id the parent's wait is keyed on. A retry attempt inherits it.
    pub notify_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub old_retry: bool,
    /// Interrupt that won the discontinuing write on this node.
    #[serde(default)]
    pub discontinued_by: Option<String>,
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
    #[serde(default)]
    pub outcome: Option<serde_json::Value>,
    pub last_updated_at: i64,
}

impl NodeExecution {
    /// Fresh QUEUED record addressed by the current level of `ambiance`.
    pub fn queued(
        ambiance: Ambiance,
        node_id: impl Into<String>,
        identifier: impl Into<String>,
        name: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        let uuid = ambiance.runtime_id().to_string();
        let parent_id = ambiance.parent_runtime_id().map(str::to_string);
        let start_ts = ambiance.current_level_start_ts();
        let group = ambiance.current_level().group.clone();
        Self {
            notify_id: uuid.clone(),
            uuid,
            ambiance,
            node_id: node_id.into(),
            name: name.into(),
            identifier: identifier.into(),
            step_type,
            status: Status::Queued,
            mode: None,
            executable_responses: Vec::new(),
            interrupt_histories: Vec::new(),
            retry_ids: Vec::new(),
            start_ts,
            end_ts: None,
            skip_graph_type: None,
            module: None,
            group,
            failure_info: None,
            parent_id,
            previous_id: None,
            old_retry: false,
            discontinued_by: None,
            context_elements: Vec::new(),
            outcome: None,
            last_updated_at: crate::now_millis(),
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        self.ambiance.plan_execution_id()
    }

    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// A node with no recorded mode has not started and is not a leaf yet.
    pub fn is_leaf(&self) -> bool {
        self.mode.map(ExecutionMode::is_leaf).unwrap_or(false)
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, StepCategory};
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        Ambiance::new(
            "pe1",
            "plan1",
            BTreeMap::new(),
            Level::new("root", "n0", "pipeline", StepType::new("children", StepCategory::Pipeline)),
        )
        .descend(
            Level::new("ne1", "n1", "build", StepType::new("sync", StepCategory::Step))
                .with_group("STEP"),
        )
    }

    #[test]
    fn queued_takes_identity_from_current_level() {
        let ne = NodeExecution::queued(
            ambiance(),
            "n1",
            "build",
            "Build",
            StepType::new("sync", StepCategory::Step),
        );
        assert_eq!(ne.uuid, "ne1");
        assert_eq!(ne.notify_id, "ne1");
        assert_eq!(ne.parent_id.as_deref(), Some("root"));
        assert_eq!(ne.status, Status::Queued);
        assert_eq!(ne.group.as_deref(), Some("STEP"));
        assert!(!ne.is_leaf());
    }

    #[test]
    fn executable_response_mode_tag() {
        let r = ExecutableResponse::Children {
            children: vec![],
            max_concurrency: 0,
            proceed_if_failed: false,
        };
        assert_eq!(r.mode(), ExecutionMode::Children);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["mode"], "CHILDREN");
    }

    #[test]
    fn timeout_failure_info_uses_engine_code() {
        let info = FailureInfo::timeout("expired after 10m");
        assert_eq!(info.code, TIMEOUT_ENGINE_EXCEPTION);
        assert_eq!(info.failure_types, vec![FailureType::TimeoutFailure]);
        assert_eq!(info.level, "ERROR");
    }
}
