//! Orchestration event system for observability.
//!
//! Emits [`OrchestrationEvent`]s via a [`tokio::sync::broadcast`] channel so
//! that in-process observers (the CLI, tests, loggers) can follow node and
//! interrupt progress without coupling to the engine internals.

use serde::{Deserialize, Serialize};

use arbor_types::{InterruptState, InterruptType, Status};

/// Events emitted while a plan execution advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestrationEvent {
    PlanExecutionStarted {
        plan_execution_id: String,
        plan_id: String,
    },
    PlanExecutionQueued {
        plan_execution_id: String,
        pipeline_identifier: String,
    },
    PlanExecutionCompleted {
        plan_execution_id: String,
        status: Status,
    },
    NodeStatusUpdated {
        plan_execution_id: String,
        node_execution_id: String,
        identifier: String,
        status: Status,
    },
    ChildrenSpawned {
        parent_node_execution_id: String,
        child_count: usize,
        max_concurrency: usize,
    },
    InterruptStateChanged {
        interrupt_id: String,
        interrupt_type: InterruptType,
        state: InterruptState,
    },
    NodesDiscontinuing {
        interrupt_id: String,
        count: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<OrchestrationEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: OrchestrationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(OrchestrationEvent::NodesDiscontinuing {
            interrupt_id: "i1".into(),
            count: 2,
        });

        match rx.recv().await.unwrap() {
            OrchestrationEvent::NodesDiscontinuing {
                interrupt_id,
                count,
            } => {
                assert_eq!(interrupt_id, "i1");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(OrchestrationEvent::PlanExecutionCompleted {
            plan_execution_id: "pe1".into(),
            status: Status::Aborted,
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                OrchestrationEvent::PlanExecutionCompleted { status, .. } => {
                    assert_eq!(status, Status::Aborted)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = EventEmitter::default();
        emitter.emit(OrchestrationEvent::PlanExecutionStarted {
            plan_execution_id: "pe1".into(),
            plan_id: "p1".into(),
        });
    }

    #[test]
    fn event_serializes() {
        let event = OrchestrationEvent::InterruptStateChanged {
            interrupt_id: "i1".into(),
            interrupt_type: InterruptType::AbortAll,
            state: InterruptState::ProcessedSuccessfully,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("InterruptStateChanged"));
        assert!(json.contains("PROCESSED_SUCCESSFULLY"));
    }
}
