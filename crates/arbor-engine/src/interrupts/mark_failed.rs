use async_trait::async_trait;

use arbor_types::{
    ArborError, FailureInfo, Interrupt, InterruptState, Result, Status, StepResponse,
};

use crate::engine::OrchestrationEngine;
use crate::interrupts::{
    claim, effect, require_active_plan_execution, require_target_node, save, settle,
    InterruptHandler,
};
use crate::store::{NodeExecutionStore, NodeUpdate};

/// MARK_FAILED: fail a node that is waiting on something, releasing whatever
/// it was waiting for. Parents waiting on children are failed through their
/// children, so only leaves and nodes that never started qualify.
pub struct MarkFailedHandler;

#[async_trait]
impl InterruptHandler for MarkFailedHandler {
    async fn register_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        require_active_plan_execution(engine, &interrupt).await?;
        let node = require_target_node(engine, &interrupt).await?;
        if !node.status.is_waiting() {
            return Err(ArborError::InvalidRequest(format!(
                "Node execution {} is {} and cannot be marked failed",
                node.uuid, node.status
            )));
        }
        if node.mode.is_some_and(|mode| !mode.is_leaf()) {
            return Err(ArborError::InvalidRequest(format!(
                "Node execution {} is waiting on its children and cannot be marked failed",
                node.uuid
            )));
        }
        let saved = save(engine, interrupt).await?;
        self.handle_interrupt(engine, saved).await
    }

    async fn handle_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        let Some(interrupt) = claim(engine, &interrupt).await? else {
            return engine.interrupt(&interrupt.uuid).await;
        };
        let outcome = mark_failed(engine, &interrupt).await;
        settle(engine, &interrupt, outcome).await
    }
}

async fn mark_failed(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
) -> Result<InterruptState> {
    let node = require_target_node(engine, interrupt).await?;
    engine.abort_node_work(&node).await?;
    engine
        .store()
        .update_node_execution(
            &node.uuid,
            vec![NodeUpdate::AppendInterruptEffect(effect(interrupt))],
        )
        .await?;

    let message = interrupt
        .interrupt_config
        .reason
        .clone()
        .unwrap_or_else(|| "Marked failed by interrupt".to_string());
    let concluded = engine
        .conclude(
            &node.uuid,
            StepResponse::failed(FailureInfo::application(message)),
            Some(Status::WAITING),
        )
        .await?;
    if concluded.is_none() {
        tracing::warn!(
            interrupt = %interrupt.uuid,
            node = %node.uuid,
            "Node left its wait before it could be failed"
        );
        return Ok(InterruptState::ProcessedUnsuccessfully);
    }
    Ok(InterruptState::ProcessedSuccessfully)
}
