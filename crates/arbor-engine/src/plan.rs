//! Static plan model: the pre-compiled description of every node a plan
//! execution may instantiate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use arbor_types::{ArborError, ChildSpec, ExecutionMode, Result, StepType};

/// Execution strategy a plan node is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Task,
    Child,
    Children,
}

impl FacilitatorType {
    pub fn execution_mode(self) -> ExecutionMode {
        match self {
            FacilitatorType::Sync => ExecutionMode::Sync,
            FacilitatorType::Async => ExecutionMode::Async,
            FacilitatorType::Task => ExecutionMode::Task,
            FacilitatorType::Child => ExecutionMode::Child,
            FacilitatorType::Children => ExecutionMode::Children,
        }
    }

    /// Step type used when the node's own type has no registered handler.
    pub fn default_step_type(self) -> &'static str {
        match self {
            FacilitatorType::Sync => "sync",
            FacilitatorType::Async => "async",
            FacilitatorType::Task => "task",
            FacilitatorType::Child => "child",
            FacilitatorType::Children => "children",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    #[default]
    Fail,
    /// Park the failed node in INTERVENTION_WAITING until a RETRY or
    /// MARK_FAILED interrupt resolves it.
    ManualIntervention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub group: Option<String>,
    pub facilitator: FacilitatorType,
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    /// YAML with `<+input>` placeholders the node waits on before running.
    #[serde(default)]
    pub execution_input_template: Option<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub skip_graph_type: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
}

impl PlanNode {
    /// Children declared by a `Children` node, in declared order.
    ///
    /// Entries are either a bare node id or `{node_id, strategy_metadata}`.
    pub fn child_specs(&self) -> Result<Vec<ChildSpec>> {
        let Some(entries) = self.step_parameters.get("children") else {
            return Ok(Vec::new());
        };
        let entries = entries.as_array().ok_or_else(|| {
            ArborError::InvalidRequest(format!(
                "node '{}': 'children' must be an array",
                self.identifier
            ))
        })?;
        entries
            .iter()
            .map(|entry| match entry {
                serde_json::Value::String(id) => Ok(ChildSpec {
                    child_node_id: id.clone(),
                    strategy_metadata: None,
                }),
                serde_json::Value::Object(map) => {
                    let id = map.get("node_id").and_then(|v| v.as_str()).ok_or_else(|| {
                        ArborError::InvalidRequest(format!(
                            "node '{}': child entry is missing 'node_id'",
                            self.identifier
                        ))
                    })?;
                    Ok(ChildSpec {
                        child_node_id: id.to_string(),
                        strategy_metadata: map.get("strategy_metadata").cloned(),
                    })
                }
                other => Err(ArborError::InvalidRequest(format!(
                    "node '{}': unsupported child entry {other}",
                    self.identifier
                ))),
            })
            .collect()
    }

    /// Child declared by a `Child` node.
    pub fn child_node_id(&self) -> Option<&str> {
        self.step_parameters.get("child").and_then(|v| v.as_str())
    }

    /// Every node id this node may instantiate.
    pub fn referenced_node_ids(&self) -> Vec<String> {
        match self.facilitator {
            FacilitatorType::Child => {
                self.child_node_id().map(str::to_string).into_iter().collect()
            }
            FacilitatorType::Children => self
                .child_specs()
                .map(|specs| specs.into_iter().map(|s| s.child_node_id).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub root_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.uuid == node_id)
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.node(&self.root_node_id)
    }

    pub fn nodes_by_id(&self) -> HashMap<&str, &PlanNode> {
        self.nodes.iter().map(|n| (n.uuid.as_str(), n)).collect()
    }
}
