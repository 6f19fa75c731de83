//! Expiry interrupts, usually issued by a timeout rather than a person.

use async_trait::async_trait;

use arbor_types::{ArborError, Interrupt, Result, Status};

use crate::engine::OrchestrationEngine;
use crate::interrupts::propagator::{self, Discontinue};
use crate::interrupts::{
    claim, require_active_plan_execution, require_target_node, save, InterruptHandler,
};
use crate::store::NodeExecutionStore;

/// EXPIRE_ALL: like ABORT_ALL, but nodes end EXPIRED with a timeout failure.
pub struct ExpireAllHandler;

#[async_trait]
impl InterruptHandler for ExpireAllHandler {
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
                propagator::handle_child_nodes(engine, interrupt, &node_id, Discontinue::Expire)
                    .await
            }
            None => propagator::handle_all_nodes(engine, interrupt, Discontinue::Expire).await,
        }
    }
}

/// MARK_EXPIRED: expire one node. Only a leaf or a node that never started
/// can be expired on its own; parents expire through their children.
pub struct MarkExpiredHandler;

#[async_trait]
impl InterruptHandler for MarkExpiredHandler {
    async fn register_interrupt(
        &self,
        engine: &OrchestrationEngine,
        interrupt: Interrupt,
    ) -> Result<Interrupt> {
        require_active_plan_execution(engine, &interrupt).await?;
        let node = require_target_node(engine, &interrupt).await?;
        let not_started = Status::not_started_statuses().contains(&node.status);
        if !node.is_leaf() && !not_started {
            return Err(ArborError::InvalidRequest(format!(
                "Node execution {} is not a leaf and has already started",
                node.uuid
            )));
        }
        if !Status::abort_and_expire_statuses().contains(&node.status) {
            return Err(ArborError::InvalidRequest(format!(
                "Node execution {} cannot be expired from status {}",
                node.uuid, node.status
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
        let Some(node_id) = interrupt.node_execution_id.clone() else {
            return Err(ArborError::InvalidRequest(
                "MARK_EXPIRED needs a target node execution".into(),
            ));
        };
        let Some(interrupt) = claim(engine, &interrupt).await? else {
            return engine.interrupt(&interrupt.uuid).await;
        };
        let marked = engine
            .store()
            .mark_leaves_discontinuing(&interrupt.plan_execution_id, &[node_id], &interrupt.uuid)
            .await;
        propagator::handle_discontinuing_nodes(engine, interrupt, marked, Discontinue::Expire).await
    }
}
