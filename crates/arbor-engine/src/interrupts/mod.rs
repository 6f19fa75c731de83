//! Interrupts: commands that stop, expire, fail, or retry parts of a running
//! plan execution.
//!
//! Each [`InterruptType`] has one [`InterruptHandler`]. Registration
//! validates the request, persists the interrupt in REGISTERED, and then
//! processes it. Processing claims the interrupt (REGISTERED to PROCESSING)
//! so that only one caller ever handles it, and always ends in one of the
//! two PROCESSED states.

mod abort;
mod expire;
mod mark_failed;
pub(crate) mod propagator;
mod retry;

pub use abort::AbortAllHandler;
pub use expire::{ExpireAllHandler, MarkExpiredHandler};
pub use mark_failed::MarkFailedHandler;
pub use retry::RetryHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use arbor_types::{
    now_millis, ArborError, Interrupt, InterruptEffect, InterruptState, InterruptType,
    NodeExecution, Result,
};

use crate::engine::OrchestrationEngine;
use crate::events::OrchestrationEvent;
use crate::store::{InterruptStore, NodeExecutionStore, PlanExecutionStore};

#[async_trait]
pub trait InterruptHandler: Send + Sync {
    /// Validate, persist, and process a new interrupt.
    async fn register_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt>;

    /// Process an interrupt already persisted in REGISTERED.
    async fn handle_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt>;
}

/// Handler table, one entry per interrupt type.
pub struct InterruptManager {
    handlers: HashMap<InterruptType, Arc<dyn InterruptHandler>>,
}

impl InterruptManager {
    pub fn new() -> Self {
        let mut handlers: HashMap<InterruptType, Arc<dyn InterruptHandler>> = HashMap::new();
        handlers.insert(InterruptType::AbortAll, Arc::new(AbortAllHandler));
        handlers.insert(InterruptType::ExpireAll, Arc::new(ExpireAllHandler));
        handlers.insert(InterruptType::MarkExpired, Arc::new(MarkExpiredHandler));
        handlers.insert(InterruptType::MarkFailed, Arc::new(MarkFailedHandler));
        handlers.insert(InterruptType::Retry, Arc::new(RetryHandler));
        Self { handlers }
    }

    pub fn get(&self, interrupt_type: InterruptType) -> Option<Arc<dyn InterruptHandler>> {
        self.handlers.get(&interrupt_type).cloned()
    }
}

impl Default for InterruptManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

/// The plan execution must exist and still be running.
pub(crate) async fn require_active_plan_execution(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
) -> Result<()> {
    let execution = engine
        .store()
        .find_plan_execution(&interrupt.plan_execution_id)
        .await?
        .ok_or_else(|| {
            ArborError::InvalidRequest(format!(
                "Plan execution {} does not exist",
                interrupt.plan_execution_id
            ))
        })?;
    if execution.is_finished() {
        return Err(ArborError::InvalidRequest(format!(
            "Plan execution {} has already finished with status {}",
            execution.uuid, execution.status
        )));
    }
    Ok(())
}

/// The node the interrupt targets, which must belong to its plan execution.
pub(crate) async fn require_target_node(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
) -> Result<NodeExecution> {
    let node_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
        ArborError::InvalidRequest(format!(
            "{} needs a target node execution",
            interrupt.interrupt_type
        ))
    })?;
    let node = engine
        .store()
        .find_node_execution(node_id)
        .await?
        .filter(|n| n.plan_execution_id() == interrupt.plan_execution_id)
        .ok_or_else(|| {
            ArborError::InvalidRequest(format!(
                "Node execution {node_id} does not exist in plan execution {}",
                interrupt.plan_execution_id
            ))
        })?;
    Ok(node)
}

/// Persist a validated interrupt. Saving an id twice keeps the first record.
pub(crate) async fn save(engine: &OrchestrationEngine, interrupt: Interrupt) -> Result<Interrupt> {
    let saved = engine.store().save_interrupt(interrupt).await?;
    tracing::info!(
        interrupt = %saved.uuid,
        interrupt_type = %saved.interrupt_type,
        plan_execution = %saved.plan_execution_id,
        node = ?saved.node_execution_id,
        "Interrupt registered"
    );
    announce(engine, &saved);
    Ok(saved)
}

/// Claim the interrupt for processing. `None` when another caller has it.
pub(crate) async fn claim(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
) -> Result<Option<Interrupt>> {
    let claimed = engine.store().mark_processing(&interrupt.uuid).await?;
    match &claimed {
        Some(claimed) => announce(engine, claimed),
        None => tracing::debug!(interrupt = %interrupt.uuid, "Interrupt already being processed"),
    }
    Ok(claimed)
}

pub(crate) async fn finish(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    state: InterruptState,
) -> Result<Interrupt> {
    let finished = engine.store().mark_processed(&interrupt.uuid, state).await?;
    tracing::info!(
        interrupt = %finished.uuid,
        interrupt_type = %finished.interrupt_type,
        state = ?finished.state,
        "Interrupt processed"
    );
    announce(engine, &finished);
    Ok(finished)
}

/// Record how processing ended. An error marks the interrupt
/// PROCESSED_UNSUCCESSFULLY before it is returned to the caller.
pub(crate) async fn settle(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    outcome: Result<InterruptState>,
) -> Result<Interrupt> {
    match outcome {
        Ok(state) => finish(engine, interrupt, state).await,
        Err(e) => {
            tracing::error!(
                interrupt = %interrupt.uuid,
                interrupt_type = %interrupt.interrupt_type,
                error = %e,
                "Interrupt processing failed"
            );
            finish(engine, interrupt, InterruptState::ProcessedUnsuccessfully).await?;
            Err(e)
        }
    }
}

/// Record of `interrupt` for a node's history.
pub(crate) fn effect(interrupt: &Interrupt) -> InterruptEffect {
    InterruptEffect {
        interrupt_id: interrupt.uuid.clone(),
        interrupt_type: interrupt.interrupt_type,
        took_effect_at: now_millis(),
        interrupt_config: interrupt.interrupt_config.clone(),
    }
}

fn announce(engine: &OrchestrationEngine, interrupt: &Interrupt) {
    engine
        .events()
        .emit(OrchestrationEvent::InterruptStateChanged {
            interrupt_id: interrupt.uuid.clone(),
            interrupt_type: interrupt.interrupt_type,
            state: interrupt.state,
        });
}
