//! Step handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use arbor_types::{Ambiance, FailureInfo, NodeExecution, Result, Status, StepResponse};

use crate::handlers::{
    AsyncHandler, ChildHandler, ChildrenHandler, SyncHandler, TaskExecutor, TaskHandler,
};
use crate::plan::PlanNode;
use crate::wait_notify::ResponseData;

/// Everything a handler sees about the node it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node_execution: NodeExecution,
    pub plan_node: PlanNode,
    /// Step parameters with expressions resolved.
    pub parameters: serde_json::Value,
    /// Merged execution input, when the node waited for one.
    pub execution_input: Option<serde_json::Value>,
}

/// Outcome of [`StepHandler::obtain_work`].
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    /// Finished synchronously.
    Done(StepResponse),
    /// Completes later through the wait/notify engine.
    Await(arbor_types::ExecutableResponse),
}

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step type this handler serves (e.g. "sync", "task", "children").
    fn step_type(&self) -> &str;

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work>;

    /// Turn the responses of a finished wait into the node's result.
    async fn handle_result(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse> {
        Ok(aggregate(responses))
    }

    /// Release anything held outside the engine before the node is discontinued.
    async fn handle_abort(&self, _node: &NodeExecution) -> Result<()> {
        Ok(())
    }
}

/// Worst child status wins: ABORTED, then EXPIRED, then FAILED.
pub fn aggregate(responses: &BTreeMap<String, ResponseData>) -> StepResponse {
    let mut worst: Option<Status> = None;
    let mut messages = Vec::new();
    for response in responses.values() {
        let status = match response {
            ResponseData::Status {
                status,
                failure_info,
                ..
            } => {
                if let Some(info) = failure_info {
                    messages.push(info.error_message.clone());
                }
                *status
            }
            ResponseData::Error { message } => {
                messages.push(message.clone());
                Status::Failed
            }
            _ => continue,
        };
        if severity(status) > worst.map(severity).unwrap_or(0) {
            worst = Some(status);
        }
    }

    match worst {
        None => StepResponse::succeeded(),
        Some(Status::Failed) => {
            let message = if messages.is_empty() {
                "Child execution failed".to_string()
            } else {
                messages.join("; ")
            };
            StepResponse::failed(FailureInfo::application(message))
        }
        Some(Status::Expired) => StepResponse {
            status: Status::Expired,
            failure_info: Some(FailureInfo::timeout(
                messages
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "Child execution expired".into()),
            )),
            outcome: None,
            context_elements: Vec::new(),
        },
        Some(status) => StepResponse::with_status(status),
    }
}

fn severity(status: Status) -> u8 {
    match status {
        Status::Aborted => 3,
        Status::Expired => 2,
        Status::Failed => 1,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// DynHandler: shared wrapper
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DynHandler(Arc<dyn StepHandler>);

impl DynHandler {
    pub fn new(handler: impl StepHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    pub fn step_type(&self) -> &str {
        self.0.step_type()
    }

    pub async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        self.0.obtain_work(ctx).await
    }

    pub async fn handle_result(
        &self,
        ctx: &StepContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse> {
        self.0.handle_result(ctx, responses).await
    }

    pub async fn handle_abort(&self, node: &NodeExecution) -> Result<()> {
        self.0.handle_abort(node).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl StepHandler + 'static) {
        let t = handler.step_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// The node's own step type when a handler serves it, otherwise the
    /// built-in handler for its facilitator.
    pub fn resolve_type(&self, node: &PlanNode) -> String {
        if self.has(&node.step_type.step_type) {
            return node.step_type.step_type.clone();
        }
        node.facilitator.default_step_type().to_string()
    }

    pub fn get(&self, step_type: &str) -> Option<&DynHandler> {
        self.handlers.get(step_type)
    }

    pub fn has(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }
}

/// Registry with every built-in handler.
pub fn default_registry(task_executor: Arc<dyn TaskExecutor>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(SyncHandler);
    registry.register(AsyncHandler);
    registry.register(TaskHandler::new(task_executor));
    registry.register(ChildHandler);
    registry.register(ChildrenHandler);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::QueuedTaskExecutor;
    use crate::plan::FacilitatorType;
    use arbor_types::{StepCategory, StepType};

    fn status(s: Status) -> ResponseData {
        ResponseData::Status {
            node_execution_id: "x".into(),
            status: s,
            failure_info: None,
        }
    }

    #[test]
    fn aggregate_all_succeeded() {
        let mut responses = BTreeMap::new();
        responses.insert("a".to_string(), status(Status::Succeeded));
        responses.insert("b".to_string(), status(Status::Skipped));
        assert_eq!(aggregate(&responses).status, Status::Succeeded);
        assert_eq!(aggregate(&BTreeMap::new()).status, Status::Succeeded);
    }

    #[test]
    fn aggregate_worst_status_wins() {
        let mut responses = BTreeMap::new();
        responses.insert("a".to_string(), status(Status::Failed));
        responses.insert("b".to_string(), status(Status::Expired));
        assert_eq!(aggregate(&responses).status, Status::Expired);

        responses.insert("c".to_string(), status(Status::Aborted));
        let result = aggregate(&responses);
        assert_eq!(result.status, Status::Aborted);
        assert!(result.failure_info.is_none());
    }

    #[test]
    fn aggregate_collects_failure_messages() {
        let mut responses = BTreeMap::new();
        responses.insert(
            "a".to_string(),
            ResponseData::Status {
                node_execution_id: "a".into(),
                status: Status::Failed,
                failure_info: Some(FailureInfo::application("disk full")),
            },
        );
        responses.insert(
            "b".to_string(),
            ResponseData::Error {
                message: "timeout talking to runner".into(),
            },
        );
        let result = aggregate(&responses);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(
            result.failure_info.unwrap().error_message,
            "disk full; timeout talking to runner"
        );
    }

    #[test]
    fn resolve_type_falls_back_to_facilitator() {
        let registry = default_registry(Arc::new(QueuedTaskExecutor::new()));
        let mut node: PlanNode = serde_yaml::from_str(
            "uuid: n\nidentifier: n\n\
             step_type: { type: shell, category: STEP }\nfacilitator: TASK\n",
        )
        .unwrap();
        assert_eq!(registry.resolve_type(&node), "task");

        node.step_type = StepType::new("children", StepCategory::Stages);
        node.facilitator = FacilitatorType::Children;
        assert_eq!(registry.resolve_type(&node), "children");
        assert!(registry.get("sync").is_some());
        assert!(!registry.has("shell"));
    }
}
