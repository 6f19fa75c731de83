//! Node status and execution mode, plus the transition table that every
//! conditional status write is checked against.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    ChildWaiting,
    ChildrenWaiting,
    InputWaiting,
    InterventionWaiting,
    Discontinuing,
    Succeeded,
    Failed,
    Expired,
    Aborted,
    Skipped,
}

impl Status {
    pub const WAITING: &'static [Status] = &[
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::ChildWaiting,
        Status::ChildrenWaiting,
        Status::InputWaiting,
        Status::InterventionWaiting,
    ];

    pub const FINAL: &'static [Status] = &[
        Status::Succeeded,
        Status::Failed,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
    ];

    /// Waits that end by resuming the node through the driver.
    pub const RESUMABLE: &'static [Status] = &[
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::ChildWaiting,
        Status::ChildrenWaiting,
    ];

    /// Returns `true` once nothing may move this node any further.
    pub fn is_final(self) -> bool {
        Self::FINAL.contains(&self)
    }

    pub fn is_waiting(self) -> bool {
        Self::WAITING.contains(&self)
    }

    /// Statuses an abort or expiry may interrupt.
    pub fn abort_and_expire_statuses() -> Vec<Status> {
        let mut statuses = vec![Status::Queued, Status::Running];
        statuses.extend_from_slice(Self::WAITING);
        statuses
    }

    /// Nodes that never started and must be discontinued regardless of mode.
    pub fn not_started_statuses() -> Vec<Status> {
        vec![Status::Queued, Status::InputWaiting]
    }

    /// The set of statuses a node must currently be in for a write moving it
    /// to `self` to be legal. Final statuses have no successors, so no
    /// target ever lists them.
    pub fn allowed_start_set(self) -> Vec<Status> {
        match self {
            Status::Queued => vec![Status::InputWaiting],
            Status::Running => {
                let mut s = vec![Status::Queued];
                s.extend_from_slice(Self::RESUMABLE);
                s
            }
            Status::AsyncWaiting
            | Status::TaskWaiting
            | Status::ChildWaiting
            | Status::ChildrenWaiting
            | Status::InterventionWaiting => vec![Status::Running],
            Status::InputWaiting => vec![Status::Queued, Status::Running],
            Status::Discontinuing => Self::abort_and_expire_statuses(),
            Status::Aborted | Status::Expired => {
                let mut s = Self::abort_and_expire_statuses();
                s.push(Status::Discontinuing);
                s
            }
            Status::Succeeded => {
                let mut s = vec![Status::Running];
                s.extend_from_slice(Self::RESUMABLE);
                s
            }
            Status::Failed => {
                let mut s = vec![Status::Running];
                s.extend_from_slice(Self::WAITING);
                s
            }
            Status::Skipped => vec![Status::Queued, Status::Running],
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ChildWaiting => "CHILD_WAITING",
            Status::ChildrenWaiting => "CHILDREN_WAITING",
            Status::InputWaiting => "INPUT_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// How a node completes; mirrors the executable response it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    Child,
    Children,
}

impl ExecutionMode {
    /// Leaf modes do their own work instead of waiting on children.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            ExecutionMode::Sync | ExecutionMode::Async | ExecutionMode::Task
        )
    }

    pub fn waiting_status(self) -> Status {
        match self {
            ExecutionMode::Sync => Status::Running,
            ExecutionMode::Async => Status::AsyncWaiting,
            ExecutionMode::Task => Status::TaskWaiting,
            ExecutionMode::Child => Status::ChildWaiting,
            ExecutionMode::Children => Status::ChildrenWaiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_statuses_have_no_successors() {
        let all = [
            Status::Queued,
            Status::Running,
            Status::AsyncWaiting,
            Status::TaskWaiting,
            Status::ChildWaiting,
            Status::ChildrenWaiting,
            Status::InputWaiting,
            Status::InterventionWaiting,
            Status::Discontinuing,
            Status::Succeeded,
            Status::Failed,
            Status::Expired,
            Status::Aborted,
            Status::Skipped,
        ];
        for target in all {
            for from in target.allowed_start_set() {
                assert!(!from.is_final(), "{target} may not start from {from}");
            }
        }
    }

    #[test]
    fn discontinuing_reachable_from_queued_and_waiting() {
        let allowed = Status::Discontinuing.allowed_start_set();
        assert!(allowed.contains(&Status::Queued));
        assert!(allowed.contains(&Status::TaskWaiting));
        assert!(!allowed.contains(&Status::Discontinuing));
    }

    #[test]
    fn normal_completion_cannot_override_discontinuing() {
        assert!(!Status::Succeeded
            .allowed_start_set()
            .contains(&Status::Discontinuing));
        assert!(Status::Aborted
            .allowed_start_set()
            .contains(&Status::Discontinuing));
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&Status::ChildrenWaiting).unwrap(),
            "\"CHILDREN_WAITING\""
        );
        assert_eq!(Status::InputWaiting.to_string(), "INPUT_WAITING");
    }

    #[test]
    fn leaf_modes() {
        assert!(ExecutionMode::Task.is_leaf());
        assert!(ExecutionMode::Sync.is_leaf());
        assert!(!ExecutionMode::Children.is_leaf());
        assert_eq!(ExecutionMode::Child.waiting_status(), Status::ChildWaiting);
    }
}
