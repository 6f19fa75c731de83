use async_trait::async_trait;

use arbor_types::{
    now_millis, ArborError, Interrupt, InterruptState, NodeExecution, Result, Status,
};

use crate::engine::OrchestrationEngine;
use crate::interrupts::{
    claim, effect, require_active_plan_execution, require_target_node, save, settle,
    InterruptHandler,
};
use crate::resume::prepare_resume_response;
use crate::retry::clone_for_retry;
use crate::store::{NodeExecutionStore, NodeUpdate};
use crate::wait_notify::EngineEvent;

/// RETRY: run a node parked for manual intervention again as a new attempt.
///
/// The old attempt is marked FAILED and flagged as an old retry without
/// notifying its parent; the new attempt inherits its notify id, so the
/// parent only ever sees the final attempt's result.
pub struct RetryHandler;

#[async_trait]
impl InterruptHandler for RetryHandler {
    async fn register_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        require_active_plan_execution(engine, &interrupt).await?;
        let node = require_target_node(engine, &interrupt).await?;
        if node.status != Status::InterventionWaiting {
            return Err(ArborError::InvalidRequest(format!(
                "Node execution {} is {} and can only be retried from {}",
                node.uuid,
                node.status,
                Status::InterventionWaiting
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
        let outcome = retry(engine, &interrupt).await;
        settle(engine, &interrupt, outcome).await
    }
}

async fn retry(engine: &OrchestrationEngine, interrupt: &Interrupt) -> Result<InterruptState> {
    let node = require_target_node(engine, interrupt).await?;
    let Some(old) = engine
        .store()
        .update_status(
            &node.uuid,
            Status::Failed,
            vec![
                NodeUpdate::AppendInterruptEffect(effect(interrupt)),
                NodeUpdate::SetEndTs(now_millis()),
            ],
            Some(&[Status::InterventionWaiting]),
        )
        .await?
    else {
        tracing::warn!(
            interrupt = %interrupt.uuid,
            node = %node.uuid,
            "Node left intervention wait before retry"
        );
        return Ok(InterruptState::ProcessedUnsuccessfully);
    };

    match replace_attempt(engine, interrupt, &old).await {
        Ok(attempt) => {
            engine.emit_status(&old);
            engine.emit_status(&attempt);
            engine.queue().push(EngineEvent::StartNode {
                node_execution_id: attempt.uuid,
            })?;
            Ok(InterruptState::ProcessedSuccessfully)
        }
        Err(e) => {
            // Put the old attempt back so the retry can be issued again.
            let restored = engine
                .store()
                .update_status(
                    &old.uuid,
                    Status::InterventionWaiting,
                    vec![],
                    Some(&[Status::Failed]),
                )
                .await;
            if let Err(restore_error) = restored {
                tracing::error!(
                    node = %old.uuid,
                    error = %restore_error,
                    "Could not return node to intervention wait"
                );
            }
            Err(e)
        }
    }
}

/// Flag `old` as superseded and persist the attempt that replaces it.
async fn replace_attempt(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    old: &NodeExecution,
) -> Result<NodeExecution> {
    let store = engine.store();
    store.mark_retried(&old.uuid).await?;

    let new_uuid = uuid::Uuid::new_v4().to_string();
    let mut attempt = clone_for_retry(
        old,
        &new_uuid,
        &interrupt.uuid,
        &interrupt.interrupt_config,
    );
    let merge_variables = engine
        .config()
        .feature_flags
        .merge_runtime_variables(old.ambiance.account_id());
    attempt.context_elements =
        prepare_resume_response(&old.context_elements, &[], merge_variables);

    store.insert_node_execution(attempt.clone()).await?;
    store
        .update_relationships_for_retry(&old.uuid, &attempt.uuid)
        .await?;
    tracing::info!(
        interrupt = %interrupt.uuid,
        old = %old.uuid,
        new = %attempt.uuid,
        attempt = attempt.retry_ids.len() + 1,
        "Node retried"
    );
    Ok(attempt)
}
