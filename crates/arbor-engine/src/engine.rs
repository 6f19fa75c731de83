//! Orchestration engine: the node lifecycle driver and the operations callers
//! use to run, feed, and interrupt plan executions.
//!
//! Work is event driven. Every state change that needs follow-up pushes an
//! [`EngineEvent`] onto the work queue; [`OrchestrationEngine::run_until_idle`]
//! or the workers from [`OrchestrationEngine::spawn_workers`] drain it. Each
//! transition is a conditional status write, so two drivers racing on the
//! same node resolve to exactly one winner and a no-op for the loser.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;

use arbor_types::{
    ambiance, now_millis, Ambiance, ArborError, ExecutableResponse, ExecutionInputInstance,
    FailureInfo, Interrupt, Level, NodeExecution, PlanExecution, Result, Status, StepResponse,
    SweepingOutput,
};

use crate::config::EngineConfig;
use crate::events::{EventEmitter, OrchestrationEvent};
use crate::execution_input::ExecutionInputService;
use crate::expression::{resolve_value, EngineExpressionResolver, ExpressionResolver};
use crate::fanout;
use crate::handler::{default_registry, DynHandler, HandlerRegistry, StepContext, Work};
use crate::handlers::TaskExecutor;
use crate::interrupts::InterruptManager;
use crate::license::{EditionCache, LicenseClient};
use crate::plan::{FailureStrategy, Plan, PlanNode};
use crate::resume;
use crate::settings::PipelineSettingsService;
use crate::store::{
    ChildInstanceStore, ExecutionStore, InputInstanceStore, InterruptStore, NodeExecutionStore,
    NodeUpdate, OutputStore, PlanExecutionStore, PlanStore,
};
use crate::validation::{validate_or_raise, Diagnostic};
use crate::wait_notify::{
    EngineEvent, NotifyCallback, ResponseData, WaitNotifyEngine, WaitSnapshot, WorkQueue,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Whether a newly created node is started right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiateMode {
    /// Persist as QUEUED and leave it for a later start.
    Create,
    CreateAndStart,
}

/// Request to run a submitted plan.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub plan_id: String,
    pub account_id: String,
    pub org_identifier: String,
    pub project_identifier: String,
    pub pipeline_identifier: String,
    /// Earlier execution whose stage outputs are copied into this one.
    pub retried_from: Option<String>,
}

impl StartRequest {
    pub fn new(
        plan_id: impl Into<String>,
        account_id: impl Into<String>,
        org_identifier: impl Into<String>,
        project_identifier: impl Into<String>,
        pipeline_identifier: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            account_id: account_id.into(),
            org_identifier: org_identifier.into(),
            project_identifier: project_identifier.into(),
            pipeline_identifier: pipeline_identifier.into(),
            retried_from: None,
        }
    }

    pub fn with_retried_from(mut self, plan_execution_id: impl Into<String>) -> Self {
        self.retried_from = Some(plan_execution_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// OrchestrationEngine
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone drives the same store and work queue.
#[derive(Clone)]
pub struct OrchestrationEngine {
    store: Arc<dyn ExecutionStore>,
    config: Arc<EngineConfig>,
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn ExpressionResolver>,
    wait_notify: Arc<WaitNotifyEngine>,
    queue: WorkQueue,
    receiver: Arc<AsyncMutex<UnboundedReceiver<EngineEvent>>>,
    events: EventEmitter,
    settings: Arc<PipelineSettingsService>,
    execution_input: Arc<ExecutionInputService>,
    interrupts: Arc<InterruptManager>,
}

impl OrchestrationEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        config: EngineConfig,
        license_client: Arc<dyn LicenseClient>,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let (queue, receiver) = WorkQueue::channel();
        let wait_notify = Arc::new(WaitNotifyEngine::with_retention(
            queue.clone(),
            config.wait_retention(),
        ));
        let resolver: Arc<dyn ExpressionResolver> =
            Arc::new(EngineExpressionResolver::new(store.clone()));
        let editions = Arc::new(EditionCache::new(license_client, config.license_cache_ttl()));
        let settings = Arc::new(PipelineSettingsService::new(
            config.restrictions.clone(),
            editions,
            store.clone(),
        ));
        let execution_input = Arc::new(ExecutionInputService::new(
            store.clone(),
            resolver.clone(),
            wait_notify.clone(),
            queue.clone(),
        ));

        Self {
            events: EventEmitter::new(config.event_channel_capacity),
            registry: Arc::new(default_registry(task_executor)),
            config: Arc::new(config),
            store,
            resolver,
            wait_notify,
            queue,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            settings,
            execution_input,
            interrupts: Arc::new(InterruptManager::new()),
        }
    }

    /// Replace the handler registry, e.g. to add custom step types.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.execution_input = Arc::new(ExecutionInputService::new(
            self.store.clone(),
            resolver.clone(),
            self.wait_notify.clone(),
            self.queue.clone(),
        ));
        self.resolver = resolver;
        self
    }

    /// Outstanding waits, for saving next to a store snapshot.
    pub fn wait_snapshot(&self) -> WaitSnapshot {
        self.wait_notify.snapshot()
    }

    /// Re-register waits saved with a store snapshot. Call once on an engine
    /// built over the restored store, before it processes any work.
    pub fn restore_waits(&self, waits: WaitSnapshot) {
        tracing::info!(waits = waits.pending_waits(), "Restoring waits");
        self.wait_notify.restore(waits);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn settings(&self) -> &PipelineSettingsService {
        &self.settings
    }

    pub fn execution_input(&self) -> &ExecutionInputService {
        &self.execution_input
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    pub(crate) fn store(&self) -> &dyn ExecutionStore {
        self.store.as_ref()
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub(crate) fn wait_notify(&self) -> &WaitNotifyEngine {
        &self.wait_notify
    }

    // -----------------------------------------------------------------------
    // Plans and plan executions
    // -----------------------------------------------------------------------

    /// Validate and persist a plan. Returns the non-fatal diagnostics.
    pub async fn submit_plan(&self, plan: Plan) -> Result<Vec<Diagnostic>> {
        let diagnostics = validate_or_raise(&plan)?;
        tracing::info!(plan = %plan.uuid, nodes = plan.nodes.len(), "Plan submitted");
        self.store.save_plan(plan).await?;
        Ok(diagnostics)
    }

    /// Start a plan execution, or queue it when admission says the pipeline
    /// already has too many running.
    pub async fn start_plan_execution(&self, request: StartRequest) -> Result<PlanExecution> {
        let plan = self.store.find_plan(&request.plan_id).await?.ok_or_else(|| {
            ArborError::InvalidRequest(format!("Plan '{}' has not been submitted", request.plan_id))
        })?;

        let mut execution = PlanExecution {
            uuid: uuid::Uuid::new_v4().to_string(),
            plan_id: request.plan_id,
            account_id: request.account_id,
            org_identifier: request.org_identifier,
            project_identifier: request.project_identifier,
            pipeline_identifier: request.pipeline_identifier,
            status: Status::Queued,
            start_ts: now_millis(),
            end_ts: None,
            retried_from: request.retried_from,
        };

        let admission = self
            .settings
            .should_queue_plan_execution(
                &execution.account_id,
                &execution.org_identifier,
                &execution.project_identifier,
                &execution.pipeline_identifier,
            )
            .await;
        if admission.should_queue {
            self.store.save_plan_execution(execution.clone()).await?;
            tracing::info!(
                plan_execution = %execution.uuid,
                pipeline = %execution.pipeline_identifier,
                "Plan execution queued"
            );
            self.events.emit(OrchestrationEvent::PlanExecutionQueued {
                plan_execution_id: execution.uuid.clone(),
                pipeline_identifier: execution.pipeline_identifier.clone(),
            });
            return Ok(execution);
        }

        execution.status = Status::Running;
        self.store.save_plan_execution(execution.clone()).await?;
        self.launch(&plan, &execution).await?;
        Ok(execution)
    }

    /// Create the root node of a RUNNING plan execution and start it.
    async fn launch(&self, plan: &Plan, execution: &PlanExecution) -> Result<()> {
        let root = plan.root().ok_or_else(|| ArborError::PlanNodeNotFound {
            plan: plan.uuid.clone(),
            node: plan.root_node_id.clone(),
        })?;

        let mut setup = BTreeMap::new();
        setup.insert(ambiance::ACCOUNT_ID.to_string(), execution.account_id.clone());
        setup.insert(
            ambiance::ORG_IDENTIFIER.to_string(),
            execution.org_identifier.clone(),
        );
        setup.insert(
            ambiance::PROJECT_IDENTIFIER.to_string(),
            execution.project_identifier.clone(),
        );
        let level = node_level(uuid::Uuid::new_v4().to_string(), root, None);
        let ambiance = Ambiance::new(&execution.uuid, &plan.uuid, setup, level);
        let node = new_node_execution(ambiance, root);
        self.store.insert_node_execution(node.clone()).await?;

        if let Some(from) = &execution.retried_from {
            resume::copy_pipeline_stage_outputs(self.store(), from, &execution.uuid, None).await?;
        }

        tracing::info!(
            plan_execution = %execution.uuid,
            plan = %plan.uuid,
            root = %node.uuid,
            "Plan execution started"
        );
        self.events.emit(OrchestrationEvent::PlanExecutionStarted {
            plan_execution_id: execution.uuid.clone(),
            plan_id: plan.uuid.clone(),
        });
        self.queue.push(EngineEvent::StartNode {
            node_execution_id: node.uuid,
        })
    }

    /// Admit queued executions of the same pipeline, oldest first, until
    /// admission says to queue again.
    async fn start_queued_executions(&self, finished: &PlanExecution) -> Result<()> {
        let queued = self
            .store
            .fetch_queued_executions(
                &finished.account_id,
                &finished.org_identifier,
                &finished.project_identifier,
                &finished.pipeline_identifier,
            )
            .await?;

        for candidate in queued {
            let admission = self
                .settings
                .should_queue_plan_execution(
                    &candidate.account_id,
                    &candidate.org_identifier,
                    &candidate.project_identifier,
                    &candidate.pipeline_identifier,
                )
                .await;
            if admission.should_queue {
                break;
            }
            let Some(execution) = self
                .store
                .update_plan_execution_status(&candidate.uuid, Status::Running, &[Status::Queued])
                .await?
            else {
                continue;
            };
            let Some(plan) = self.store.find_plan(&execution.plan_id).await? else {
                tracing::warn!(
                    plan_execution = %execution.uuid,
                    plan = %execution.plan_id,
                    "Queued execution refers to a missing plan"
                );
                self.store
                    .update_plan_execution_status(
                        &execution.uuid,
                        Status::Failed,
                        &[Status::Running],
                    )
                    .await?;
                continue;
            };
            self.launch(&plan, &execution).await?;
        }
        Ok(())
    }

    async fn complete_plan_execution(&self, root: &NodeExecution) -> Result<()> {
        let Some(execution) = self
            .store
            .update_plan_execution_status(root.plan_execution_id(), root.status, &[Status::Running])
            .await?
        else {
            tracing::debug!(
                plan_execution = %root.plan_execution_id(),
                "Plan execution already finished"
            );
            return Ok(());
        };
        tracing::info!(
            plan_execution = %execution.uuid,
            status = %execution.status,
            "Plan execution completed"
        );
        self.events.emit(OrchestrationEvent::PlanExecutionCompleted {
            plan_execution_id: execution.uuid.clone(),
            status: execution.status,
        });
        self.start_queued_executions(&execution).await
    }

    /// End a plan execution that admission control is still holding, so it
    /// is never launched. `Ok(None)` when it is no longer QUEUED.
    pub(crate) async fn discontinue_queued_execution(
        &self,
        plan_execution_id: &str,
        status: Status,
    ) -> Result<Option<PlanExecution>> {
        let Some(execution) = self
            .store
            .update_plan_execution_status(plan_execution_id, status, &[Status::Queued])
            .await?
        else {
            return Ok(None);
        };
        tracing::info!(
            plan_execution = %execution.uuid,
            status = %execution.status,
            "Queued plan execution ended before it started"
        );
        self.events.emit(OrchestrationEvent::PlanExecutionCompleted {
            plan_execution_id: execution.uuid.clone(),
            status: execution.status,
        });
        Ok(Some(execution))
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    /// Create a child node execution below `parent`.
    ///
    /// Creating the same runtime id twice is a no-op that returns the
    /// existing record.
    pub async fn initiate_node(
        &self,
        parent: &Ambiance,
        child_node_id: &str,
        runtime_id: &str,
        strategy_metadata: Option<serde_json::Value>,
        mode: InitiateMode,
    ) -> Result<NodeExecution> {
        let plan_node = self
            .store
            .fetch_plan_node(parent.plan_id(), child_node_id)
            .await?;
        let level = node_level(runtime_id.to_string(), &plan_node, strategy_metadata);
        let node = new_node_execution(parent.descend(level), &plan_node);

        if !self.store.insert_node_execution(node.clone()).await? {
            tracing::debug!(node = %runtime_id, "Node execution already exists");
            return self.store.get_node_execution(runtime_id).await;
        }
        tracing::debug!(
            node = %node.uuid,
            identifier = %node.identifier,
            parent = %parent.runtime_id(),
            ?mode,
            "Node execution created"
        );
        self.emit_status(&node);
        if mode == InitiateMode::CreateAndStart {
            self.queue.push(EngineEvent::StartNode {
                node_execution_id: node.uuid.clone(),
            })?;
        }
        Ok(node)
    }

    /// Move a QUEUED node to RUNNING and run its handler.
    pub async fn start_node(&self, node_execution_id: &str) -> Result<()> {
        let node = self.store.get_node_execution(node_execution_id).await?;
        if node.status != Status::Queued {
            tracing::debug!(
                node = %node.uuid,
                status = %node.status,
                "Node not queued, skipping start"
            );
            return Ok(());
        }
        let plan_node = self
            .store
            .fetch_plan_node(node.ambiance.plan_id(), &node.node_id)
            .await?;

        let mut execution_input = None;
        if let Some(template) = &plan_node.execution_input_template {
            match self.store.find_input_instance_by_node(&node.uuid).await? {
                Some(instance) if instance.is_completed() => {
                    execution_input = instance.merged_input_template;
                }
                Some(_) => {
                    tracing::debug!(node = %node.uuid, "Still waiting for execution input");
                    return Ok(());
                }
                None => {
                    self.execution_input
                        .wait_for_execution_input(&node, template)
                        .await?;
                    if let Ok(waiting) = self.store.get_node_execution(&node.uuid).await {
                        self.emit_status(&waiting);
                    }
                    return Ok(());
                }
            }
        }

        let mode = plan_node.facilitator.execution_mode();
        let Some(node) = self
            .store
            .update_status(
                node_execution_id,
                Status::Running,
                vec![NodeUpdate::SetMode(mode)],
                Some(&[Status::Queued]),
            )
            .await?
        else {
            tracing::debug!(node = %node_execution_id, "Lost the race to start node");
            return Ok(());
        };
        self.emit_status(&node);
        tracing::info!(node = %node.uuid, identifier = %node.identifier, ?mode, "Node started");

        let ctx = match self.step_context(node, plan_node, execution_input).await {
            Ok(ctx) => ctx,
            Err(e) => return self.fail_node(node_execution_id, e).await,
        };
        let handler = match self.handler_for(&ctx.plan_node, node_execution_id) {
            Ok(handler) => handler,
            Err(e) => return self.fail_node(node_execution_id, e).await,
        };

        match handler.obtain_work(&ctx).await {
            Ok(Work::Done(response)) => {
                self.process_step_response(node_execution_id, response).await
            }
            Ok(Work::Await(executable)) => {
                self.handle_executable(&ctx, &handler, executable).await
            }
            Err(e) => self.fail_node(node_execution_id, e).await,
        }
    }

    async fn handle_executable(
        &self,
        ctx: &StepContext,
        handler: &DynHandler,
        executable: ExecutableResponse,
    ) -> Result<()> {
        let id = ctx.node_execution.uuid.as_str();
        let waiting = executable.mode().waiting_status();
        let Some(node) = self
            .store
            .update_status(
                id,
                waiting,
                vec![NodeUpdate::AppendExecutableResponse(executable.clone())],
                Some(&[Status::Running]),
            )
            .await?
        else {
            tracing::warn!(node = %id, "Node moved while its work was being obtained");
            if matches!(executable, ExecutableResponse::Task { .. }) {
                let mut orphan = ctx.node_execution.clone();
                orphan.executable_responses.push(executable);
                handler.handle_abort(&orphan).await?;
            }
            return Ok(());
        };
        self.emit_status(&node);

        let resume = NotifyCallback::EngineResume {
            node_execution_id: node.uuid.clone(),
        };
        match executable {
            ExecutableResponse::Sync => {
                self.queue.push(EngineEvent::Callback {
                    callback: resume,
                    responses: BTreeMap::new(),
                })?;
            }
            ExecutableResponse::Async { callback_ids } => {
                self.wait_notify.wait_for_all_on(resume, callback_ids)?;
            }
            ExecutableResponse::Task { task_id } => {
                self.wait_notify.wait_for_all_on(resume, vec![task_id])?;
            }
            ExecutableResponse::Child { child_node_id } => {
                let child_id = uuid::Uuid::new_v4().to_string();
                self.wait_notify
                    .wait_for_all_on(resume, vec![child_id.clone()])?;
                self.initiate_node(
                    &node.ambiance,
                    &child_node_id,
                    &child_id,
                    None,
                    InitiateMode::CreateAndStart,
                )
                .await?;
            }
            ExecutableResponse::Children {
                children,
                max_concurrency,
                proceed_if_failed,
            } => {
                let spawned = fanout::spawn_children(
                    self,
                    &node,
                    children,
                    max_concurrency,
                    proceed_if_failed,
                )
                .await;
                if let Err(e) = spawned {
                    if !e.is_terminal() {
                        return Err(e);
                    }
                    return self.fail_node(id, e).await;
                }
            }
        }
        Ok(())
    }

    /// Continue a node whose wait finished.
    pub async fn resume_node(
        &self,
        node_execution_id: &str,
        responses: BTreeMap<String, ResponseData>,
    ) -> Result<()> {
        let Some(node) = self
            .store
            .update_status(node_execution_id, Status::Running, vec![], Some(Status::RESUMABLE))
            .await?
        else {
            tracing::debug!(node = %node_execution_id, "Node no longer waiting, resume skipped");
            return Ok(());
        };
        self.emit_status(&node);
        if node.mode == Some(arbor_types::ExecutionMode::Children) {
            self.store.delete_child_instance(&node.uuid).await?;
        }

        let plan_node = self
            .store
            .fetch_plan_node(node.ambiance.plan_id(), &node.node_id)
            .await?;
        let execution_input = self
            .store
            .find_input_instance_by_node(&node.uuid)
            .await?
            .and_then(|i| i.merged_input_template);
        let ctx = match self.step_context(node, plan_node, execution_input).await {
            Ok(ctx) => ctx,
            Err(e) => return self.fail_node(node_execution_id, e).await,
        };
        let handler = match self.handler_for(&ctx.plan_node, node_execution_id) {
            Ok(handler) => handler,
            Err(e) => return self.fail_node(node_execution_id, e).await,
        };
        tracing::debug!(node = %node_execution_id, responses = responses.len(), "Node resumed");

        match handler.handle_result(&ctx, &responses).await {
            Ok(response) => self.process_step_response(node_execution_id, response).await,
            Err(e) => self.fail_node(node_execution_id, e).await,
        }
    }

    /// Apply a handler's result. A failure on a node whose strategy asks for
    /// manual intervention parks it instead of concluding.
    pub async fn process_step_response(
        &self,
        node_execution_id: &str,
        response: StepResponse,
    ) -> Result<()> {
        if response.status == Status::Failed {
            let node = self.store.get_node_execution(node_execution_id).await?;
            let plan_node = self
                .store
                .fetch_plan_node(node.ambiance.plan_id(), &node.node_id)
                .await?;
            if plan_node.failure_strategy == FailureStrategy::ManualIntervention {
                let parked = self
                    .store
                    .update_status(
                        node_execution_id,
                        Status::InterventionWaiting,
                        vec![
                            NodeUpdate::SetFailureInfo(response.failure_info.clone()),
                            NodeUpdate::AddContextElements(response.context_elements.clone()),
                        ],
                        Some(&[Status::Running]),
                    )
                    .await?;
                if let Some(parked) = parked {
                    tracing::info!(node = %parked.uuid, "Node failed, waiting for intervention");
                    self.emit_status(&parked);
                    return Ok(());
                }
            }
        }
        self.conclude(node_execution_id, response, None).await?;
        Ok(())
    }

    /// Move a node to the response's final status and notify whoever waits on
    /// it. `allowed_from` overrides the transition table's start set.
    ///
    /// `Ok(None)` means the node had already moved on.
    pub(crate) async fn conclude(
        &self,
        node_execution_id: &str,
        response: StepResponse,
        allowed_from: Option<&[Status]>,
    ) -> Result<Option<NodeExecution>> {
        let mut ops = vec![
            NodeUpdate::SetFailureInfo(response.failure_info.clone()),
            NodeUpdate::SetEndTs(now_millis()),
        ];
        if let Some(outcome) = &response.outcome {
            ops.push(NodeUpdate::SetOutcome(outcome.clone()));
        }
        if !response.context_elements.is_empty() {
            ops.push(NodeUpdate::AddContextElements(response.context_elements.clone()));
        }
        let Some(node) = self
            .store
            .update_status(node_execution_id, response.status, ops, allowed_from)
            .await?
        else {
            tracing::debug!(
                node = %node_execution_id,
                status = %response.status,
                "Node already moved, conclusion dropped"
            );
            return Ok(None);
        };

        if let Some(outcome) = response.outcome {
            self.store
                .save_output(SweepingOutput {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    plan_execution_id: node.plan_execution_id().to_string(),
                    producer_id: node.uuid.clone(),
                    name: node.identifier.clone(),
                    group: node.group.clone(),
                    value: outcome,
                    created_at: now_millis(),
                })
                .await?;
        }

        tracing::info!(
            node = %node.uuid,
            identifier = %node.identifier,
            status = %node.status,
            "Node concluded"
        );
        self.emit_status(&node);

        if node.parent_id.is_some() {
            self.wait_notify.done_with(
                &node.notify_id,
                ResponseData::Status {
                    node_execution_id: node.uuid.clone(),
                    status: node.status,
                    failure_info: node.failure_info.clone(),
                },
            )?;
        } else {
            self.complete_plan_execution(&node).await?;
        }
        Ok(Some(node))
    }

    async fn fail_node(&self, node_execution_id: &str, error: ArborError) -> Result<()> {
        tracing::warn!(node = %node_execution_id, error = %error, "Step failed");
        self.process_step_response(
            node_execution_id,
            StepResponse::failed(FailureInfo::application(error.to_string())),
        )
        .await
    }

    /// Let the node's handler release external work before it is discontinued.
    pub(crate) async fn abort_node_work(&self, node: &NodeExecution) -> Result<()> {
        let plan_node = self
            .store
            .fetch_plan_node(node.ambiance.plan_id(), &node.node_id)
            .await?;
        let handler = self.handler_for(&plan_node, &node.uuid)?;
        handler.handle_abort(node).await
    }

    async fn step_context(
        &self,
        node: NodeExecution,
        plan_node: PlanNode,
        execution_input: Option<serde_json::Value>,
    ) -> Result<StepContext> {
        let parameters =
            resolve_value(self.resolver.as_ref(), &node.ambiance, &plan_node.step_parameters)
                .await?;
        Ok(StepContext {
            ambiance: node.ambiance.clone(),
            node_execution: node,
            plan_node,
            parameters,
            execution_input,
        })
    }

    fn handler_for(&self, plan_node: &PlanNode, node_execution_id: &str) -> Result<DynHandler> {
        let step_type = self.registry.resolve_type(plan_node);
        self.registry
            .get(&step_type)
            .cloned()
            .ok_or_else(|| ArborError::HandlerError {
                step_type: step_type.clone(),
                node: node_execution_id.to_string(),
                message: format!("No handler registered for type '{step_type}'"),
            })
    }

    pub(crate) fn emit_status(&self, node: &NodeExecution) {
        self.events.emit(OrchestrationEvent::NodeStatusUpdated {
            plan_execution_id: node.plan_execution_id().to_string(),
            node_execution_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            status: node.status,
        });
    }

    // -----------------------------------------------------------------------
    // External completions
    // -----------------------------------------------------------------------

    /// Report the result of a task handed to the [`TaskExecutor`].
    pub fn task_completed(&self, task_id: &str, payload: serde_json::Value) -> Result<()> {
        self.notify(task_id, payload)
    }

    /// Deliver a payload for an async callback id.
    pub fn notify(&self, callback_id: &str, payload: serde_json::Value) -> Result<()> {
        self.wait_notify
            .done_with(callback_id, ResponseData::Payload { value: payload })
    }

    pub fn notify_error(&self, callback_id: &str, message: impl Into<String>) -> Result<()> {
        self.wait_notify.done_with_error(callback_id, message)
    }

    // -----------------------------------------------------------------------
    // Interrupts and execution input
    // -----------------------------------------------------------------------

    /// Register an interrupt and process it. Registering an interrupt whose
    /// id is already known returns the stored record unchanged.
    pub async fn register_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt> {
        if let Some(existing) = self.store.find_interrupt(&interrupt.uuid).await? {
            tracing::debug!(interrupt = %existing.uuid, "Interrupt already registered");
            return Ok(existing);
        }
        let handler = self.interrupts.get(interrupt.interrupt_type).ok_or_else(|| {
            ArborError::InvalidRequest(format!(
                "No handler for interrupt type {}",
                interrupt.interrupt_type
            ))
        })?;
        handler.register_interrupt(self, interrupt).await
    }

    pub async fn submit_execution_input(
        &self,
        node_execution_id: &str,
        input_yaml: &str,
    ) -> Result<bool> {
        self.execution_input
            .continue_execution(node_execution_id, input_yaml)
            .await
    }

    pub async fn continue_with_default(&self, node_execution_id: &str) -> Result<bool> {
        self.execution_input
            .continue_with_default(node_execution_id)
            .await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn node_execution(&self, node_execution_id: &str) -> Result<NodeExecution> {
        self.store.get_node_execution(node_execution_id).await
    }

    pub async fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.store.fetch_node_executions(plan_execution_id).await
    }

    pub async fn interrupt(&self, interrupt_id: &str) -> Result<Interrupt> {
        self.store.get_interrupt(interrupt_id).await
    }

    pub async fn interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.store.fetch_interrupts(plan_execution_id).await
    }

    pub async fn plan_execution(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        self.store.get_plan_execution(plan_execution_id).await
    }

    pub async fn execution_input_instance(
        &self,
        node_execution_id: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        self.execution_input
            .get_execution_input_instance(node_execution_id)
            .await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Process queued work until none is left. Returns how many events ran.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = { self.receiver.lock().await.try_recv().ok() };
            let Some(event) = next else {
                break;
            };
            self.dispatch_logged(event).await;
            processed += 1;
        }
        processed
    }

    /// Run `count` workers that process events until every engine handle is
    /// dropped.
    pub fn spawn_workers(&self, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let engine = self.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { engine.receiver.lock().await.recv().await };
                        let Some(event) = next else {
                            tracing::debug!(worker, "Work queue closed");
                            break;
                        };
                        engine.dispatch_logged(event).await;
                    }
                })
            })
            .collect()
    }

    async fn dispatch_logged(&self, event: EngineEvent) {
        let label = event_label(&event);
        if let Err(e) = self.dispatch(event).await {
            tracing::error!(event = label, error = %e, "Engine event failed");
        }
    }

    async fn dispatch(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::StartNode { node_execution_id } => {
                self.start_node(&node_execution_id).await
            }
            EngineEvent::Callback {
                callback,
                responses,
            } => match callback {
                NotifyCallback::EngineResume { node_execution_id } => {
                    self.resume_node(&node_execution_id, responses).await
                }
                NotifyCallback::MaxConcurrentChild {
                    parent_node_execution_id,
                    proceed_if_failed,
                } => {
                    fanout::on_child_completed(
                        self,
                        &parent_node_execution_id,
                        proceed_if_failed,
                        &responses,
                    )
                    .await
                }
                NotifyCallback::ExecutionInput {
                    node_execution_id, ..
                } => self.requeue_after_input(&node_execution_id).await,
            },
        }
    }

    async fn requeue_after_input(&self, node_execution_id: &str) -> Result<()> {
        let requeued = self
            .store
            .update_status(
                node_execution_id,
                Status::Queued,
                vec![],
                Some(&[Status::InputWaiting]),
            )
            .await?;
        match requeued {
            Some(node) => {
                self.emit_status(&node);
                self.queue.push(EngineEvent::StartNode {
                    node_execution_id: node.uuid,
                })
            }
            None => {
                tracing::debug!(node = %node_execution_id, "Node already left input wait");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node_level(
    runtime_id: String,
    plan_node: &PlanNode,
    strategy_metadata: Option<serde_json::Value>,
) -> Level {
    let mut level = Level::new(
        runtime_id,
        plan_node.uuid.clone(),
        plan_node.identifier.clone(),
        plan_node.step_type.clone(),
    );
    if let Some(group) = &plan_node.group {
        level = level.with_group(group.clone());
    }
    if let Some(metadata) = strategy_metadata {
        level = level.with_strategy_metadata(metadata);
    }
    level
}

fn new_node_execution(ambiance: Ambiance, plan_node: &PlanNode) -> NodeExecution {
    let name = if plan_node.name.is_empty() {
        plan_node.identifier.clone()
    } else {
        plan_node.name.clone()
    };
    let mut node = NodeExecution::queued(
        ambiance,
        plan_node.uuid.clone(),
        plan_node.identifier.clone(),
        name,
        plan_node.step_type.clone(),
    );
    node.module = plan_node.module.clone();
    node.skip_graph_type = plan_node.skip_graph_type.clone();
    node
}

fn event_label(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::StartNode { .. } => "start_node",
        EngineEvent::Callback { callback, .. } => match callback {
            NotifyCallback::EngineResume { .. } => "engine_resume",
            NotifyCallback::MaxConcurrentChild { .. } => "max_concurrent_child",
            NotifyCallback::ExecutionInput { .. } => "execution_input",
        },
    }
}
