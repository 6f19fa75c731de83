//! Task steps: work delegated to an external executor that reports back
//! through [`crate::OrchestrationEngine::task_completed`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use arbor_types::{
    Ambiance, ExecutableResponse, FailureInfo, NodeExecution, Result, Status, StepResponse,
};

use crate::handler::{StepContext, StepHandler, Work};
use crate::handlers::{payload_context_elements, payload_result};
use crate::wait_notify::ResponseData;

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Hand the task off and return the id its completion will be keyed on.
    async fn queue_task(&self, ambiance: &Ambiance, parameters: &serde_json::Value)
        -> Result<String>;

    /// Stop a task that is still running.
    async fn abort_task(&self, task_id: &str) -> Result<()>;
}

pub struct TaskHandler {
    executor: Arc<dyn TaskExecutor>,
}

impl TaskHandler {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StepHandler for TaskHandler {
    fn step_type(&self) -> &str {
        "task"
    }

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        let task_id = self
            .executor
            .queue_task(&ctx.ambiance, &ctx.parameters)
            .await?;
        tracing::info!(node = %ctx.node_execution.uuid, task = %task_id, "Task queued");
        Ok(Work::Await(ExecutableResponse::Task { task_id }))
    }

    /// A payload of `{"status": "FAILED", "message": ..}` fails the step.
    /// A `context_elements` list in the payload is published either way.
    async fn handle_result(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse> {
        for response in responses.values() {
            if let ResponseData::Payload { value } = response {
                let failed = value
                    .get("status")
                    .and_then(|s| serde_json::from_value::<Status>(s.clone()).ok())
                    == Some(Status::Failed);
                if failed {
                    let message = value
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("Task failed");
                    return Ok(StepResponse::failed(FailureInfo::application(message))
                        .with_context_elements(payload_context_elements(responses)));
                }
            }
        }
        Ok(payload_result(responses))
    }

    async fn handle_abort(&self, node: &NodeExecution) -> Result<()> {
        if let Some(ExecutableResponse::Task { task_id }) = node.last_executable_response() {
            tracing::info!(node = %node.uuid, task = %task_id, "Aborting task");
            self.executor.abort_task(task_id).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueuedTaskExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub task_id: String,
    pub node_execution_id: String,
    pub parameters: serde_json::Value,
}

/// Keeps queued tasks in memory until someone drains and completes them.
#[derive(Debug, Default)]
pub struct QueuedTaskExecutor {
    pending: Mutex<Vec<QueuedTask>>,
    aborted: Mutex<Vec<String>>,
}

impl QueuedTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every task queued since the last call.
    pub fn drain_pending(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl TaskExecutor for QueuedTaskExecutor {
    async fn queue_task(
        &self,
        ambiance: &Ambiance,
        parameters: &serde_json::Value,
    ) -> Result<String> {
        let task = QueuedTask {
            task_id: uuid::Uuid::new_v4().to_string(),
            node_execution_id: ambiance.runtime_id().to_string(),
            parameters: parameters.clone(),
        };
        let task_id = task.task_id.clone();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
        Ok(task_id)
    }

    async fn abort_task(&self, task_id: &str) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|t| t.task_id != task_id);
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::ctx;

    #[tokio::test]
    async fn task_is_queued_and_awaited() {
        let executor = Arc::new(QueuedTaskExecutor::new());
        let handler = TaskHandler::new(executor.clone());
        let work = handler
            .obtain_work(&ctx(serde_json::json!({ "command": "make" })))
            .await
            .unwrap();

        let pending = executor.drain_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].node_execution_id, "n1");
        assert_eq!(
            work,
            Work::Await(ExecutableResponse::Task {
                task_id: pending[0].task_id.clone()
            })
        );
        assert!(executor.drain_pending().is_empty());
    }

    #[tokio::test]
    async fn abort_targets_the_awaited_task() {
        let executor = Arc::new(QueuedTaskExecutor::new());
        let handler = TaskHandler::new(executor.clone());
        let mut node = ctx(serde_json::Value::Null).node_execution;

        // nothing awaited yet: nothing to abort
        handler.handle_abort(&node).await.unwrap();
        assert!(executor.aborted().is_empty());

        node.executable_responses.push(ExecutableResponse::Task {
            task_id: "t-9".into(),
        });
        handler.handle_abort(&node).await.unwrap();
        assert_eq!(executor.aborted(), vec!["t-9".to_string()]);
    }

    #[tokio::test]
    async fn failed_payload_fails_the_step() {
        let handler = TaskHandler::new(Arc::new(QueuedTaskExecutor::new()));
        let mut responses = BTreeMap::new();
        responses.insert(
            "t1".to_string(),
            ResponseData::Payload {
                value: serde_json::json!({ "status": "FAILED", "message": "exit 137" }),
            },
        );
        let resp = handler
            .handle_result(&ctx(serde_json::Value::Null), &responses)
            .await
            .unwrap();
        assert_eq!(resp.status, Status::Failed);
        assert_eq!(resp.failure_info.unwrap().error_message, "exit 137");

        responses.insert(
            "t1".to_string(),
            ResponseData::Payload {
                value: serde_json::json!({ "exit_code": 0 }),
            },
        );
        let resp = handler
            .handle_result(&ctx(serde_json::Value::Null), &responses)
            .await
            .unwrap();
        assert_eq!(resp.status, Status::Succeeded);
    }
}
