//! Persisted bookkeeping records that are not node executions.

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Fan-out bookkeeping for one parent: which children exist, and how many
/// of them (in declared order) have been admitted to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrentChildInstance {
    pub parent_node_execution_id: String,
    pub children_node_execution_ids: Vec<String>,
    /// Index of the next child to start; everything below it was started.
    pub cursor: usize,
}

impl ConcurrentChildInstance {
    pub fn remaining(&self) -> usize {
        self.children_node_execution_ids
            .len()
            .saturating_sub(self.cursor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInputInstance {
    pub input_instance_id: String,
    pub node_execution_id: String,
    /// YAML template with `<+input>` placeholders.
    pub template: String,
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub merged_input_template: Option<serde_json::Value>,
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

impl ExecutionInputInstance {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Named value produced by one node and visible to later nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepingOutput {
    pub uuid: String,
    pub plan_execution_id: String,
    pub producer_id: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub value: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextElementKind {
    /// Workflow variables, stored as a JSON object.
    Standard,
    Artifact,
    ArtifactVariable,
    Environment,
}

impl ContextElementKind {
    pub fn is_artifact(self) -> bool {
        matches!(
            self,
            ContextElementKind::Artifact | ContextElementKind::ArtifactVariable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextElement {
    pub kind: ContextElementKind,
    pub name: String,
    pub value: serde_json::Value,
}

/// Top-level record for one run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub account_id: String,
    pub org_identifier: String,
    pub project_identifier: String,
    pub pipeline_identifier: String,
    pub status: Status,
    pub start_ts: i64,
    #[serde(default)]
    pub end_ts: Option<i64>,
    /// Execution this one was derived from, for reruns.
    #[serde(default)]
    pub retried_from: Option<String>,
}

impl PlanExecution {
    pub fn is_finished(&self) -> bool {
        self.status.is_final()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_children_after_cursor() {
        let c = ConcurrentChildInstance {
            parent_node_execution_id: "p".into(),
            children_node_execution_ids: vec!["a".into(), "b".into(), "c".into()],
            cursor: 2,
        };
        assert_eq!(c.remaining(), 1);

        let exhausted = ConcurrentChildInstance { cursor: 5, ..c };
        assert_eq!(exhausted.remaining(), 0);
    }

    #[test]
    fn artifact_kinds() {
        assert!(ContextElementKind::Artifact.is_artifact());
        assert!(ContextElementKind::ArtifactVariable.is_artifact());
        assert!(!ContextElementKind::Standard.is_artifact());
    }
}
