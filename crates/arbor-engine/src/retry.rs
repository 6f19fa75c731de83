//! Building the next attempt of a node that is being retried.

use arbor_types::{
    now_millis, Ambiance, InterruptConfig, InterruptEffect, InterruptType, NodeExecution, Status,
};

/// Ambiance for a new attempt: same position in the tree, fresh runtime id
/// and start time on the current level.
pub fn retry_ambiance(old: &NodeExecution, new_uuid: &str) -> Ambiance {
    let mut level = old.ambiance.current_level().clone();
    level.runtime_id = new_uuid.to_string();
    level.start_ts = now_millis();
    old.ambiance.replace_current(level)
}

/// A QUEUED copy of `old` that takes its place in the tree.
///
/// The new attempt inherits the old node's notify id and parent so whoever
/// waited on the old attempt is satisfied by this one. `retry_ids` is the
/// old node's history with the old id appended.
pub fn clone_for_retry(
    old: &NodeExecution,
    new_uuid: &str,
    interrupt_id: &str,
    interrupt_config: &InterruptConfig,
) -> NodeExecution {
    let ambiance = retry_ambiance(old, new_uuid);
    let mut retry_ids = old.retry_ids.clone();
    retry_ids.push(old.uuid.clone());
    let now = now_millis();

    NodeExecution {
        uuid: new_uuid.to_string(),
        start_ts: ambiance.current_level_start_ts(),
        ambiance,
        node_id: old.node_id.clone(),
        name: old.name.clone(),
        identifier: old.identifier.clone(),
        step_type: old.step_type.clone(),
        status: Status::Queued,
        mode: None,
        executable_responses: Vec::new(),
        interrupt_histories: vec![InterruptEffect {
            interrupt_id: interrupt_id.to_string(),
            interrupt_type: InterruptType::Retry,
            took_effect_at: now,
            interrupt_config: interrupt_config.clone(),
        }],
        retry_ids,
        end_ts: None,
        skip_graph_type: old.skip_graph_type.clone(),
        module: old.module.clone(),
        group: old.group.clone(),
        failure_info: None,
        notify_id: old.notify_id.clone(),
        parent_id: old.parent_id.clone(),
        previous_id: old.previous_id.clone(),
        old_retry: false,
        discontinued_by: None,
        context_elements: Vec::new(),
        outcome: None,
        last_updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{FailureInfo, Level, StepCategory, StepType};

    fn failed_child() -> NodeExecution {
        let root = Ambiance::new(
            "pe1",
            "plan1",
            Default::default(),
            Level::new("root", "r", "pipeline", StepType::new("children", StepCategory::Pipeline)),
        );
        let ambiance = root.descend(
            Level::new("c1", "deploy", "deploy", StepType::new("task", StepCategory::Step))
                .with_group("STEP"),
        );
        let mut node = NodeExecution::queued(
            ambiance,
            "deploy",
            "deploy",
            "Deploy",
            StepType::new("task", StepCategory::Step),
        );
        node.status = Status::Failed;
        node.previous_id = Some("c0".into());
        node.failure_info = Some(FailureInfo::application("exit 1"));
        node
    }

    #[test]
    fn new_attempt_takes_the_old_nodes_place() {
        let old = failed_child();
        let config = InterruptConfig::manual("ops");
        let new = clone_for_retry(&old, "c1-retry", "int-1", &config);

        assert_eq!(new.uuid, "c1-retry");
        assert_eq!(new.ambiance.runtime_id(), "c1-retry");
        assert_eq!(new.ambiance.parent_runtime_id(), Some("root"));
        assert_eq!(new.status, Status::Queued);
        assert_eq!(new.notify_id, "c1");
        assert_eq!(new.parent_id.as_deref(), Some("root"));
        assert_eq!(new.previous_id.as_deref(), Some("c0"));
        assert_eq!(new.retry_ids, vec!["c1".to_string()]);
        assert!(new.failure_info.is_none());
        assert!(new.mode.is_none());
        assert_eq!(new.group.as_deref(), Some("STEP"));

        let effect = &new.interrupt_histories[0];
        assert_eq!(effect.interrupt_id, "int-1");
        assert_eq!(effect.interrupt_type, InterruptType::Retry);
    }

    #[test]
    fn retry_history_accumulates() {
        let old = failed_child();
        let config = InterruptConfig::system();
        let second = clone_for_retry(&old, "c2", "i1", &config);
        let third = clone_for_retry(&second, "c3", "i2", &config);
        assert_eq!(third.retry_ids, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(third.notify_id, "c1");
    }
}
