//! Bounded child fan-out.
//!
//! A parent in CHILDREN mode creates every child up front but starts only
//! the first `max` of them. Each child's completion fires a
//! MaxConcurrentChild callback that admits the next queued child by
//! advancing the parent's cursor, so at most `max` children run at once.
//! A failure without `proceed_if_failed` exhausts the cursor and skips
//! every child that never started.

use std::collections::BTreeMap;

use arbor_types::{
    ChildSpec, ConcurrentChildInstance, NodeExecution, Result, Status, StepResponse,
};

use crate::engine::{InitiateMode, OrchestrationEngine};
use crate::events::OrchestrationEvent;
use crate::store::{ChildInstanceStore, NodeExecutionStore};
use crate::wait_notify::{EngineEvent, NotifyCallback, ResponseData};

pub(crate) async fn spawn_children(
    engine: &OrchestrationEngine,
    parent: &NodeExecution,
    children: Vec<ChildSpec>,
    requested_concurrency: u64,
    proceed_if_failed: bool,
) -> Result<()> {
    let resume = NotifyCallback::EngineResume {
        node_execution_id: parent.uuid.clone(),
    };
    if children.is_empty() {
        tracing::debug!(node = %parent.uuid, "No children to run");
        return engine.queue().push(EngineEvent::Callback {
            callback: resume,
            responses: BTreeMap::new(),
        });
    }

    let limit = engine
        .settings()
        .max_concurrency_based_on_edition(parent.ambiance.account_id(), children.len() as u64)
        .await?;
    let max = if requested_concurrency > 0 && requested_concurrency < limit {
        requested_concurrency
    } else {
        limit
    };
    let max = usize::try_from(max).unwrap_or(usize::MAX).min(children.len());

    let ids: Vec<String> = children
        .iter()
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect();
    engine
        .store()
        .save_child_instance(ConcurrentChildInstance {
            parent_node_execution_id: parent.uuid.clone(),
            children_node_execution_ids: ids.clone(),
            cursor: max,
        })
        .await?;

    for (index, (spec, id)) in children.into_iter().zip(&ids).enumerate() {
        let mode = if index < max {
            InitiateMode::CreateAndStart
        } else {
            InitiateMode::Create
        };
        engine
            .initiate_node(
                &parent.ambiance,
                &spec.child_node_id,
                id,
                spec.strategy_metadata,
                mode,
            )
            .await?;
    }

    let wait_notify = engine.wait_notify();
    for id in &ids {
        wait_notify.wait_for_all_on(
            NotifyCallback::MaxConcurrentChild {
                parent_node_execution_id: parent.uuid.clone(),
                proceed_if_failed,
            },
            vec![id.clone()],
        )?;
    }
    wait_notify.wait_for_all_on(resume, ids.clone())?;

    tracing::info!(
        node = %parent.uuid,
        children = ids.len(),
        max_concurrency = max,
        "Children spawned"
    );
    engine.events().emit(OrchestrationEvent::ChildrenSpawned {
        parent_node_execution_id: parent.uuid.clone(),
        child_count: ids.len(),
        max_concurrency: max,
    });
    Ok(())
}

/// One child of `parent_id` finished: admit the next one, or skip the rest
/// when it failed and the parent does not proceed on failure.
///
/// Only a child that was started held a slot, so a child that ended while
/// still queued (aborted or expired before its turn) admits nobody.
pub(crate) async fn on_child_completed(
    engine: &OrchestrationEngine,
    parent_id: &str,
    proceed_if_failed: bool,
    responses: &BTreeMap<String, ResponseData>,
) -> Result<()> {
    let store = engine.store();
    let parent_waiting = store
        .find_node_execution(parent_id)
        .await?
        .is_some_and(|p| p.status == Status::ChildrenWaiting);
    let instance = match store.find_child_instance(parent_id).await? {
        Some(instance) if parent_waiting => instance,
        _ => {
            tracing::debug!(node = %parent_id, "Parent no longer running children");
            return Ok(());
        }
    };

    let failed = responses.values().any(|r| match r {
        ResponseData::Status { status, .. } => matches!(status, Status::Failed | Status::Expired),
        ResponseData::Error { .. } => true,
        _ => false,
    });

    if failed && !proceed_if_failed {
        let unstarted = store.exhaust_cursor(parent_id).await?;
        if !unstarted.is_empty() {
            tracing::info!(
                node = %parent_id,
                skipped = unstarted.len(),
                "Child failed, skipping children that never started"
            );
        }
        for id in unstarted {
            engine
                .conclude(
                    &id,
                    StepResponse::with_status(Status::Skipped),
                    Some(&[Status::Queued]),
                )
                .await?;
        }
        return Ok(());
    }

    if !held_slot(&instance, responses) {
        tracing::debug!(node = %parent_id, "Child ended before it started");
        return Ok(());
    }

    while let Some(next) = store.advance_cursor(parent_id).await? {
        let still_queued = store
            .find_node_execution(&next)
            .await?
            .is_some_and(|n| n.status == Status::Queued);
        if still_queued {
            tracing::debug!(node = %parent_id, child = %next, "Admitting next child");
            return engine.queue().push(EngineEvent::StartNode {
                node_execution_id: next,
            });
        }
        tracing::debug!(
            node = %parent_id,
            child = %next,
            "Child already ended, passing over it"
        );
    }
    Ok(())
}

/// Whether the finished child was one the cursor had already started. A
/// retried child is listed under its newest attempt's id.
fn held_slot(
    instance: &ConcurrentChildInstance,
    responses: &BTreeMap<String, ResponseData>,
) -> bool {
    let ids = &instance.children_node_execution_ids;
    let started = &ids[..instance.cursor.min(ids.len())];
    responses.iter().any(|(id, response)| {
        let attempt = match response {
            ResponseData::Status {
                node_execution_id, ..
            } => Some(node_execution_id),
            _ => None,
        };
        started
            .iter()
            .any(|child| child == id || Some(child) == attempt)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(cursor: usize) -> ConcurrentChildInstance {
        ConcurrentChildInstance {
            parent_node_execution_id: "p".into(),
            children_node_execution_ids: vec!["c0".into(), "c1".into(), "c2".into()],
            cursor,
        }
    }

    fn finished(key: &str, node_execution_id: &str) -> BTreeMap<String, ResponseData> {
        let mut responses = BTreeMap::new();
        responses.insert(
            key.to_string(),
            ResponseData::Status {
                node_execution_id: node_execution_id.into(),
                status: Status::Aborted,
                failure_info: None,
            },
        );
        responses
    }

    #[test]
    fn only_started_children_hold_a_slot() {
        assert!(held_slot(&instance(2), &finished("c1", "c1")));
        assert!(!held_slot(&instance(2), &finished("c2", "c2")));
        assert!(held_slot(&instance(3), &finished("c2", "c2")));
    }

    #[test]
    fn retried_child_is_matched_by_its_newest_attempt() {
        let mut retried = instance(2);
        retried.children_node_execution_ids[0] = "c0-retry".into();
        assert!(held_slot(&retried, &finished("c0", "c0-retry")));
    }
}
