//! Discontinuing nodes on behalf of an abort or expire interrupt.
//!
//! Propagation is two-phase. First every target node is moved to
//! DISCONTINUING with the interrupt recorded as its owner, in one bulk write
//! for the whole-tree case. Then each node that interrupt owns has its
//! external work released and is concluded ABORTED or EXPIRED. A node
//! already claimed by another interrupt is left to that interrupt.

use std::collections::{HashMap, HashSet};

use arbor_types::{
    FailureInfo, Interrupt, InterruptState, NodeExecution, Result, Status, StepResponse,
};

use crate::engine::OrchestrationEngine;
use crate::events::OrchestrationEvent;
use crate::interrupts::{claim, effect, finish, settle};
use crate::store::{fetch_all_pages, NodeExecutionStore, NodeUpdate};

/// How discontinued nodes end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discontinue {
    Abort,
    Expire,
}

impl Discontinue {
    fn final_status(self) -> Status {
        match self {
            Discontinue::Abort => Status::Aborted,
            Discontinue::Expire => Status::Expired,
        }
    }

    fn response(self, interrupt: &Interrupt) -> StepResponse {
        match self {
            Discontinue::Abort => StepResponse::with_status(Status::Aborted),
            Discontinue::Expire => {
                let message = interrupt
                    .interrupt_config
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Execution expired".to_string());
                StepResponse {
                    status: Status::Expired,
                    failure_info: Some(FailureInfo::timeout(message)),
                    outcome: None,
                    context_elements: Vec::new(),
                }
            }
        }
    }
}

/// Discontinue every leaf and every not-yet-started node of the plan
/// execution. A plan execution still queued by admission control has no
/// nodes yet and is ended directly.
pub(crate) async fn handle_all_nodes(
    engine: &OrchestrationEngine,
    interrupt: Interrupt,
    action: Discontinue,
) -> Result<Interrupt> {
    let Some(interrupt) = claim(engine, &interrupt).await? else {
        return engine.interrupt(&interrupt.uuid).await;
    };
    let queued = engine
        .discontinue_queued_execution(&interrupt.plan_execution_id, action.final_status())
        .await;
    match queued {
        Ok(Some(_)) => {
            return finish(engine, &interrupt, InterruptState::ProcessedSuccessfully).await
        }
        Ok(None) => {}
        Err(e) => return settle(engine, &interrupt, Err(e)).await,
    }
    let marked = engine
        .store()
        .mark_all_leaves_and_queued_discontinuing(
            &interrupt.plan_execution_id,
            &Status::abort_and_expire_statuses(),
            &interrupt.uuid,
        )
        .await;
    handle_discontinuing_nodes(engine, interrupt, marked, action).await
}

/// Discontinue the leaves and not-yet-started nodes below (and including)
/// `node_execution_id`.
pub(crate) async fn handle_child_nodes(
    engine: &OrchestrationEngine,
    interrupt: Interrupt,
    node_execution_id: &str,
    action: Discontinue,
) -> Result<Interrupt> {
    let Some(interrupt) = claim(engine, &interrupt).await? else {
        return engine.interrupt(&interrupt.uuid).await;
    };
    let marked = mark_subtree(engine, &interrupt, node_execution_id).await;
    handle_discontinuing_nodes(engine, interrupt, marked, action).await
}

async fn mark_subtree(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    node_execution_id: &str,
) -> Result<u64> {
    let store = engine.store();
    let statuses = Status::abort_and_expire_statuses();
    let statuses = statuses.as_slice();
    let plan_execution_id = interrupt.plan_execution_id.as_str();
    let candidates = fetch_all_pages(engine.config().interrupt_batch_size, move |page| {
        store.fetch_without_old_retries_in(plan_execution_id, statuses, page)
    })
    .await?;

    let targets: Vec<String> = subtree(&candidates, node_execution_id)
        .into_iter()
        .filter(|n| n.is_leaf() || Status::not_started_statuses().contains(&n.status))
        .map(|n| n.uuid.clone())
        .collect();
    tracing::debug!(
        interrupt = %interrupt.uuid,
        node = %node_execution_id,
        targets = targets.len(),
        "Subtree targets collected"
    );
    store
        .mark_leaves_discontinuing(plan_execution_id, &targets, &interrupt.uuid)
        .await
}

/// `root_id` and its descendants among `nodes`.
fn subtree<'a>(nodes: &'a [NodeExecution], root_id: &str) -> Vec<&'a NodeExecution> {
    let mut by_parent: HashMap<&str, Vec<&NodeExecution>> = HashMap::new();
    for node in nodes {
        if let Some(parent) = node.parent_id.as_deref() {
            by_parent.entry(parent).or_default().push(node);
        }
    }

    let mut out: Vec<&NodeExecution> = nodes.iter().filter(|n| n.uuid == root_id).collect();
    let mut frontier = vec![root_id];
    let mut seen = HashSet::new();
    while let Some(id) = frontier.pop() {
        if !seen.insert(id) {
            continue;
        }
        for child in by_parent.get(id).into_iter().flatten() {
            out.push(child);
            frontier.push(child.uuid.as_str());
        }
    }
    out
}

/// Conclude every node `interrupt` moved to DISCONTINUING and record the
/// interrupt's final state.
pub(crate) async fn handle_discontinuing_nodes(
    engine: &OrchestrationEngine,
    interrupt: Interrupt,
    marked: Result<u64>,
    action: Discontinue,
) -> Result<Interrupt> {
    let count = match marked {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(interrupt = %interrupt.uuid, error = %e, "Marking nodes failed");
            finish(engine, &interrupt, InterruptState::ProcessedUnsuccessfully).await?;
            return Err(e);
        }
    };
    if count == 0 {
        tracing::info!(interrupt = %interrupt.uuid, "No nodes to discontinue");
        return finish(engine, &interrupt, InterruptState::ProcessedSuccessfully).await;
    }
    engine.events().emit(OrchestrationEvent::NodesDiscontinuing {
        interrupt_id: interrupt.uuid.clone(),
        count,
    });

    let store = engine.store();
    let plan_execution_id = interrupt.plan_execution_id.as_str();
    let owner = interrupt.uuid.as_str();
    let discontinuing = fetch_all_pages(engine.config().interrupt_batch_size, move |page| {
        store.fetch_by_status(plan_execution_id, Status::Discontinuing, Some(owner), page)
    })
    .await;
    let nodes = match discontinuing {
        Ok(nodes) => nodes,
        Err(e) => {
            finish(engine, &interrupt, InterruptState::ProcessedUnsuccessfully).await?;
            return Err(e);
        }
    };

    match process_discontinued_instances(engine, &interrupt, nodes, action).await {
        Ok(()) => finish(engine, &interrupt, InterruptState::ProcessedSuccessfully).await,
        Err(e) => {
            finish(engine, &interrupt, InterruptState::ProcessedUnsuccessfully).await?;
            Err(e)
        }
    }
}

/// Discontinue each node in turn. A failure on one node does not stop the
/// rest; the first error is returned once all have been tried.
pub(crate) async fn process_discontinued_instances(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    nodes: Vec<NodeExecution>,
    action: Discontinue,
) -> Result<()> {
    let mut first_error = None;
    for node in nodes {
        if let Err(e) = discontinue(engine, interrupt, &node, action).await {
            tracing::error!(
                interrupt = %interrupt.uuid,
                node = %node.uuid,
                error = %e,
                "Failed to discontinue node"
            );
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn discontinue(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    node: &NodeExecution,
    action: Discontinue,
) -> Result<()> {
    engine.abort_node_work(node).await?;
    engine
        .store()
        .update_node_execution(
            &node.uuid,
            vec![NodeUpdate::AppendInterruptEffect(effect(interrupt))],
        )
        .await?;
    engine
        .conclude(&node.uuid, action.response(interrupt), None)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{Ambiance, Level, StepCategory, StepType};

    fn node(id: &str, parent: Option<&NodeExecution>) -> NodeExecution {
        let step_type = StepType::new("sync", StepCategory::Step);
        let level = Level::new(id, id, id, step_type.clone());
        let ambiance = match parent {
            Some(p) => p.ambiance.descend(level),
            None => Ambiance::new("pe1", "plan1", Default::default(), level),
        };
        NodeExecution::queued(ambiance, id, id, id, step_type)
    }

    #[test]
    fn subtree_includes_root_and_all_descendants() {
        let root = node("root", None);
        let a = node("a", Some(&root));
        let b = node("b", Some(&root));
        let a1 = node("a1", Some(&a));
        let nodes = vec![root, a, b, a1];

        let mut ids: Vec<_> = subtree(&nodes, "a").iter().map(|n| n.uuid.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "a1"]);

        assert_eq!(subtree(&nodes, "root").len(), 4);
        assert!(subtree(&nodes, "missing").is_empty());
    }

    #[test]
    fn expire_uses_reason_as_timeout_message() {
        let interrupt = Interrupt::new(
            arbor_types::InterruptType::ExpireAll,
            "pe1",
            None,
            arbor_types::InterruptConfig::system().with_reason("deadline passed"),
        );
        let response = Discontinue::Expire.response(&interrupt);
        assert_eq!(response.status, Status::Expired);
        let info = response.failure_info.unwrap();
        assert_eq!(info.error_message, "deadline passed");
        assert_eq!(info.code, arbor_types::execution::TIMEOUT_ENGINE_EXCEPTION);
        assert_eq!(
            Discontinue::Abort.response(&interrupt),
            StepResponse::with_status(Status::Aborted)
        );
    }
}
