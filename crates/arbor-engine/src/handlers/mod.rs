//! Built-in step handlers, one per facilitator.

pub mod children;
pub mod task;

pub use children::{ChildHandler, ChildrenHandler};
pub use task::{QueuedTask, QueuedTaskExecutor, TaskExecutor, TaskHandler};

use std::collections::BTreeMap;

use async_trait::async_trait;

use arbor_types::{
    ArborError, ContextElement, ExecutableResponse, FailureInfo, Result, StepResponse,
};

use crate::handler::{StepContext, StepHandler, Work};
use crate::wait_notify::ResponseData;

// ---------------------------------------------------------------------------
// SyncHandler: finishes in place from its parameters
// ---------------------------------------------------------------------------

/// Parameters:
/// - `fail`: `true` or a failure message makes the step fail
/// - `outputs`: JSON recorded as the step's outcome
/// - `context_elements`: artifacts and variables the step publishes
pub struct SyncHandler;

#[async_trait]
impl StepHandler for SyncHandler {
    fn step_type(&self) -> &str {
        "sync"
    }

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        let params = &ctx.parameters;
        let context_elements: Vec<ContextElement> = match params.get("context_elements") {
            Some(elements) => serde_json::from_value(elements.clone()).map_err(|e| {
                ArborError::HandlerError {
                    step_type: self.step_type().into(),
                    node: ctx.node_execution.uuid.clone(),
                    message: format!("invalid 'context_elements': {e}"),
                }
            })?,
            None => Vec::new(),
        };
        let failure = match params.get("fail") {
            Some(serde_json::Value::Bool(true)) => Some(
                params
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Step failed"),
            ),
            Some(serde_json::Value::String(message)) => Some(message.as_str()),
            _ => None,
        };
        if let Some(message) = failure {
            return Ok(Work::Done(
                StepResponse::failed(FailureInfo::application(message))
                    .with_context_elements(context_elements),
            ));
        }

        let mut outcome = params
            .get("outputs")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(input), Some(map)) = (&ctx.execution_input, outcome.as_object_mut()) {
            map.insert("execution_input".into(), input.clone());
        }
        tracing::debug!(node = %ctx.node_execution.uuid, "Sync step finished");
        Ok(Work::Done(
            StepResponse::succeeded()
                .with_outcome(outcome)
                .with_context_elements(context_elements),
        ))
    }
}

// ---------------------------------------------------------------------------
// AsyncHandler: waits on caller-supplied callback ids
// ---------------------------------------------------------------------------

pub struct AsyncHandler;

#[async_trait]
impl StepHandler for AsyncHandler {
    fn step_type(&self) -> &str {
        "async"
    }

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        let callback_ids: Vec<String> = match ctx.parameters.get("callback_ids") {
            Some(ids) => serde_json::from_value(ids.clone()).map_err(|e| {
                ArborError::HandlerError {
                    step_type: self.step_type().into(),
                    node: ctx.node_execution.uuid.clone(),
                    message: format!("'callback_ids' must be a list of strings: {e}"),
                }
            })?,
            None => vec![uuid::Uuid::new_v4().to_string()],
        };
        Ok(Work::Await(ExecutableResponse::Async { callback_ids }))
    }

    async fn handle_result(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse> {
        Ok(payload_result(responses))
    }
}

/// Any error response fails the step; otherwise payloads become the outcome.
pub(crate) fn payload_result(responses: &BTreeMap<String, ResponseData>) -> StepResponse {
    let errors: Vec<&str> = responses
        .values()
        .filter_map(|r| match r {
            ResponseData::Error { message } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    let context_elements = payload_context_elements(responses);
    if !errors.is_empty() {
        return StepResponse::failed(FailureInfo::application(errors.join("; ")))
            .with_context_elements(context_elements);
    }

    let mut outcome = serde_json::Map::new();
    for (id, response) in responses {
        if let ResponseData::Payload { value } = response {
            outcome.insert(id.clone(), value.clone());
        }
    }
    StepResponse::succeeded()
        .with_outcome(serde_json::Value::Object(outcome))
        .with_context_elements(context_elements)
}

/// `context_elements` lists found in payloads. Malformed lists are skipped.
pub(crate) fn payload_context_elements(
    responses: &BTreeMap<String, ResponseData>,
) -> Vec<ContextElement> {
    let mut elements = Vec::new();
    for (id, response) in responses {
        let ResponseData::Payload { value } = response else {
            continue;
        };
        let Some(listed) = value.get("context_elements") else {
            continue;
        };
        match serde_json::from_value::<Vec<ContextElement>>(listed.clone()) {
            Ok(listed) => elements.extend(listed),
            Err(e) => {
                tracing::warn!(callback = %id, error = %e, "Ignoring malformed context elements")
            }
        }
    }
    elements
}
