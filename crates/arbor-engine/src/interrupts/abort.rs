use async_trait::async_trait;

use arbor_types::{Interrupt, Result};

use crate::engine::OrchestrationEngine;
use crate::interrupts::propagator::{self, Discontinue};
use crate::interrupts::{require_active_plan_execution, require_target_node, save, InterruptHandler};

/// ABORT_ALL: abort the whole plan execution, or the subtree of the target
/// node when one is given.
pub struct AbortAllHandler;

#[async_trait]
impl InterruptHandler for AbortAllHandler {
    async fn register_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        require_active_plan_execution(engine, &interrupt).await?;
        if interrupt.node_execution_id.is_some() {
            require_target_node(engine, &interrupt).await?;
        }
        let saved = save(engine, interrupt).await?;
        self.handle_interrupt(engine, saved).await
    }

    async fn handle_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        match interrupt.node_execution_id.clone() {
            Some(node_id) => {
                propagator::handle_child_nodes(engine, interrupt, &node_id, Discontinue::Abort)
                    .await
            }
            None => propagator::handle_all_nodes(engine, interrupt, Discontinue::Abort).await,
        }
    }
}
