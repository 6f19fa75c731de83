//! Execution input: parking a node until the user supplies the values its
//! template asks for, then validating and merging them.

use std::sync::Arc;

use arbor_types::{
    now_millis, ArborError, ExecutionInputInstance, NodeExecution, Result, Status,
};

use crate::expression::ExpressionResolver;
use crate::fqn;
use crate::store::{ExecutionStore, InputInstanceStore, NodeExecutionStore};
use crate::wait_notify::{EngineEvent, NotifyCallback, ResponseData, WaitNotifyEngine, WorkQueue};

pub struct ExecutionInputService {
    store: Arc<dyn ExecutionStore>,
    resolver: Arc<dyn ExpressionResolver>,
    wait_notify: Arc<WaitNotifyEngine>,
    queue: WorkQueue,
}

impl ExecutionInputService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        resolver: Arc<dyn ExpressionResolver>,
        wait_notify: Arc<WaitNotifyEngine>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            store,
            resolver,
            wait_notify,
            queue,
        }
    }

    /// Park `node` in INPUT_WAITING behind a fresh input instance. `None`
    /// when the node already moved on.
    pub async fn wait_for_execution_input(
        &self,
        node: &NodeExecution,
        template: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        let waiting = self
            .store
            .update_status(&node.uuid, Status::InputWaiting, vec![], None)
            .await?;
        if waiting.is_none() {
            tracing::warn!(node = %node.uuid, "Node moved before it could wait for input");
            return Ok(None);
        }

        let instance = ExecutionInputInstance {
            input_instance_id: uuid::Uuid::new_v4().to_string(),
            node_execution_id: node.uuid.clone(),
            template: template.to_string(),
            user_input: None,
            merged_input_template: None,
            created_at: now_millis(),
            completed_at: None,
        };
        self.store.save_input_instance(instance.clone()).await?;
        self.wait_notify.wait_for_all_on(
            NotifyCallback::ExecutionInput {
                node_execution_id: node.uuid.clone(),
                input_instance_id: instance.input_instance_id.clone(),
            },
            vec![instance.input_instance_id.clone()],
        )?;
        tracing::info!(
            node = %node.uuid,
            input_instance = %instance.input_instance_id,
            "Waiting for execution input"
        );
        Ok(Some(instance))
    }

    /// Validate and merge `input_yaml`, then release the waiting node.
    ///
    /// `Ok(false)` when there is nothing waiting for input; invalid fields are
    /// rejected with [`ArborError::InvalidInputFields`].
    pub async fn continue_execution(
        &self,
        node_execution_id: &str,
        input_yaml: &str,
    ) -> Result<bool> {
        let Some(instance) = self.merge_and_complete(node_execution_id, input_yaml).await? else {
            return Ok(false);
        };
        self.wait_notify.done_with(
            &instance.input_instance_id,
            ResponseData::ExecutionInput {
                input_instance_id: instance.input_instance_id.clone(),
            },
        )?;
        Ok(true)
    }

    /// Accept the template as-is and restart the node directly.
    pub async fn continue_with_default(&self, node_execution_id: &str) -> Result<bool> {
        let Some(instance) = self.merge_and_complete(node_execution_id, "").await? else {
            return Ok(false);
        };

        let queued = self
            .store
            .update_status(
                node_execution_id,
                Status::Queued,
                vec![],
                Some(&[Status::InputWaiting]),
            )
            .await?;
        if queued.is_some() {
            self.queue.push(EngineEvent::StartNode {
                node_execution_id: node_execution_id.to_string(),
            })?;
        }
        // release the wait too; its own requeue loses the status race
        self.wait_notify.done_with(
            &instance.input_instance_id,
            ResponseData::ExecutionInput {
                input_instance_id: instance.input_instance_id.clone(),
            },
        )?;
        Ok(true)
    }

    async fn merge_and_complete(
        &self,
        node_execution_id: &str,
        input_yaml: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        let Some(instance) = self.store.find_input_instance_by_node(node_execution_id).await? else {
            tracing::warn!(node = %node_execution_id, "No execution input instance for node");
            return Ok(None);
        };
        if instance.is_completed() {
            tracing::warn!(node = %node_execution_id, "Execution input already supplied");
            return Ok(None);
        }

        let node = self.store.get_node_execution(node_execution_id).await?;
        let input_yaml = if input_yaml.trim().is_empty() {
            instance.template.as_str()
        } else {
            input_yaml
        };
        let resolved = self.resolver.resolve(&node.ambiance, input_yaml).await?;

        let invalid = fqn::invalid_fqns(&instance.template, &resolved)?;
        if !invalid.is_empty() {
            for (field, reason) in &invalid {
                tracing::debug!(
                    node = %node_execution_id,
                    field = %field,
                    reason = %reason,
                    "Invalid input field"
                );
            }
            return Err(ArborError::InvalidInputFields {
                fields: invalid.into_keys().collect(),
            });
        }

        let merged = fqn::merge_input(&instance.template, &resolved)?;
        let completed = self
            .store
            .complete_input_instance(&instance.input_instance_id, resolved, merged)
            .await?;
        if !completed {
            tracing::warn!(node = %node_execution_id, "Execution input was supplied concurrently");
            return Ok(None);
        }
        tracing::info!(node = %node_execution_id, "Execution input accepted");
        self.store
            .find_input_instance(&instance.input_instance_id)
            .await
    }

    pub async fn get_execution_input_instance(
        &self,
        node_execution_id: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        self.store.find_input_instance_by_node(node_execution_id).await
    }

    pub async fn is_present(&self, node_execution_id: &str) -> Result<bool> {
        Ok(self
            .store
            .find_input_instance_by_node(node_execution_id)
            .await?
            .is_some())
    }

    pub async fn get_execution_input_instances(
        &self,
        node_execution_ids: &[String],
    ) -> Result<Vec<ExecutionInputInstance>> {
        let mut instances = Vec::new();
        for id in node_execution_ids {
            if let Some(instance) = self.store.find_input_instance_by_node(id).await? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::EngineExpressionResolver;
    use crate::store::{InMemoryStore, NodeExecutionStore};
    use arbor_types::{Ambiance, Level, StepCategory, StepType};
    use tokio::sync::mpsc::UnboundedReceiver;

    const TEMPLATE: &str = "env: <+input>.allowedValues(dev,prod)\nreplicas: <+input>.default(1)\n";

    struct Fixture {
        service: ExecutionInputService,
        store: Arc<InMemoryStore>,
        rx: UnboundedReceiver<EngineEvent>,
        node: NodeExecution,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let (queue, rx) = WorkQueue::channel();
        let wait_notify = Arc::new(WaitNotifyEngine::new(queue.clone()));
        let service = ExecutionInputService::new(
            store.clone(),
            Arc::new(EngineExpressionResolver::new(store.clone())),
            wait_notify,
            queue,
        );
        let step_type = StepType::new("sync", StepCategory::Step);
        let ambiance = Ambiance::new(
            "pe1",
            "plan1",
            Default::default(),
            Level::new("n1", "n1", "approve", step_type.clone()),
        );
        let node = NodeExecution::queued(ambiance, "n1", "approve", "approve", step_type);
        store.insert_node_execution(node.clone()).await.unwrap();
        Fixture {
            service,
            store,
            rx,
            node,
        }
    }

    #[tokio::test]
    async fn input_releases_the_wait_once() {
        let mut f = fixture().await;
        let instance = f
            .service
            .wait_for_execution_input(&f.node, TEMPLATE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.store.get_node_execution("n1").await.unwrap().status,
            Status::InputWaiting
        );
        assert!(f.service.is_present("n1").await.unwrap());

        assert!(f.service.continue_execution("n1", "env: prod\n").await.unwrap());
        match f.rx.try_recv().unwrap() {
            EngineEvent::Callback { callback, .. } => assert_eq!(
                callback,
                NotifyCallback::ExecutionInput {
                    node_execution_id: "n1".into(),
                    input_instance_id: instance.input_instance_id.clone()
                }
            ),
            other => panic!("unexpected event: {other:?}"),
        }

        let stored = f
            .service
            .get_execution_input_instance("n1")
            .await
            .unwrap()
            .unwrap();
        let merged = stored.merged_input_template.unwrap();
        assert_eq!(merged["env"], "prod");
        assert_eq!(merged["replicas"], 1);

        // second submission finds the instance completed
        assert!(!f.service.continue_execution("n1", "env: dev\n").await.unwrap());
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected_and_wait_stays_open() {
        let mut f = fixture().await;
        f.service
            .wait_for_execution_input(&f.node, TEMPLATE)
            .await
            .unwrap();

        let err = f
            .service
            .continue_execution("n1", "env: qa\ncolor: blue\n")
            .await
            .unwrap_err();
        match err {
            ArborError::InvalidInputFields { fields } => {
                assert_eq!(fields, vec!["color".to_string(), "env".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.rx.try_recv().is_err());
        let instance = f.service.get_execution_input_instance("n1").await.unwrap().unwrap();
        assert!(!instance.is_completed());
    }

    #[tokio::test]
    async fn continue_with_default_requeues_the_node() {
        let mut f = fixture().await;
        f.service
            .wait_for_execution_input(&f.node, TEMPLATE)
            .await
            .unwrap();

        assert!(f.service.continue_with_default("n1").await.unwrap());
        assert_eq!(
            f.store.get_node_execution("n1").await.unwrap().status,
            Status::Queued
        );
        assert_eq!(
            f.rx.try_recv().unwrap(),
            EngineEvent::StartNode {
                node_execution_id: "n1".into()
            }
        );
        // the wait's own callback still fires
        assert!(matches!(f.rx.try_recv().unwrap(), EngineEvent::Callback { .. }));
    }

    #[tokio::test]
    async fn nothing_waiting_returns_false() {
        let f = fixture().await;
        assert!(!f.service.continue_execution("n1", "env: dev").await.unwrap());
        assert!(!f.service.continue_with_default("n1").await.unwrap());
        assert!(f
            .service
            .get_execution_input_instances(&["n1".to_string()])
            .await
            .unwrap()
            .is_empty());
    }
}
