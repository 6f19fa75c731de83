//! Durable store contracts.
//!
//! Every mutation is a single-record operation. Status changes go through
//! [`NodeExecutionStore::update_status`], a compare-and-set on the current
//! status: `Ok(None)` means another writer moved the node first, which is an
//! expected outcome and never an error.

mod memory;

pub use memory::{InMemoryStore, StoreSnapshot};

use async_trait::async_trait;

use arbor_types::{
    ConcurrentChildInstance, ContextElement, ContextElementKind, ExecutableResponse,
    ExecutionInputInstance, ExecutionMode, FailureInfo, Interrupt, InterruptEffect,
    InterruptState, NodeExecution, PlanExecution, Result, Status, SweepingOutput,
};

use crate::plan::{Plan, PlanNode};

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn of(page: usize, size: usize) -> Self {
        Self { page, size }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Slice an already ordered result set.
    pub fn from_sorted(all: Vec<T>, request: PageRequest) -> Self {
        let size = request.size.max(1);
        let total_elements = all.len();
        let total_pages = total_elements.div_ceil(size);
        let content = all
            .into_iter()
            .skip(request.page * size)
            .take(size)
            .collect();
        Page {
            content,
            total_elements,
            total_pages,
        }
    }
}

/// Walk every page of a paginated query, collecting the content.
pub async fn fetch_all_pages<T, F, Fut>(batch_size: usize, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>>>,
{
    let mut all = Vec::new();
    let mut current = 0;
    loop {
        let page = fetch(PageRequest::of(current, batch_size)).await?;
        if page.total_elements == 0 {
            break;
        }
        let total_pages = page.total_pages;
        all.extend(page.content);
        current += 1;
        if current >= total_pages {
            break;
        }
    }
    Ok(all)
}

// ---------------------------------------------------------------------------
// Field updates
// ---------------------------------------------------------------------------

/// One field operation applied together with a node write.
#[derive(Debug, Clone)]
pub enum NodeUpdate {
    SetMode(ExecutionMode),
    AppendExecutableResponse(ExecutableResponse),
    AppendInterruptEffect(InterruptEffect),
    SetFailureInfo(Option<FailureInfo>),
    SetOutcome(serde_json::Value),
    SetEndTs(i64),
    AddContextElements(Vec<ContextElement>),
}

impl NodeUpdate {
    pub fn apply(&self, node: &mut NodeExecution) {
        match self {
            NodeUpdate::SetMode(mode) => node.mode = Some(*mode),
            NodeUpdate::AppendExecutableResponse(r) => node.executable_responses.push(r.clone()),
            NodeUpdate::AppendInterruptEffect(e) => node.interrupt_histories.push(e.clone()),
            NodeUpdate::SetFailureInfo(info) => node.failure_info = info.clone(),
            NodeUpdate::SetOutcome(v) => node.outcome = Some(v.clone()),
            NodeUpdate::SetEndTs(ts) => node.end_ts = Some(*ts),
            NodeUpdate::AddContextElements(elements) => {
                for element in elements {
                    upsert_context_element(&mut node.context_elements, element);
                }
            }
        }
    }
}

/// Add `element`, replacing one of the same kind and name. Variable objects
/// are merged key by key with the incoming values winning.
fn upsert_context_element(elements: &mut Vec<ContextElement>, element: &ContextElement) {
    let Some(existing) = elements
        .iter_mut()
        .find(|e| e.kind == element.kind && e.name == element.name)
    else {
        elements.push(element.clone());
        return;
    };
    match (existing.value.as_object_mut(), element.value.as_object()) {
        (Some(target), Some(source)) if element.kind == ContextElementKind::Standard => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => existing.value = element.value.clone(),
    }
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert a new record. Re-inserting an existing uuid keeps the stored one
    /// and returns `false`, so duplicate delivery of a create is harmless.
    async fn insert_node_execution(&self, node: NodeExecution) -> Result<bool>;

    async fn find_node_execution(&self, id: &str) -> Result<Option<NodeExecution>>;

    async fn get_node_execution(&self, id: &str) -> Result<NodeExecution> {
        self.find_node_execution(id)
            .await?
            .ok_or_else(|| arbor_types::ArborError::NodeExecutionNotFound(id.to_string()))
    }

    /// Field updates without a status guard.
    async fn update_node_execution(&self, id: &str, ops: Vec<NodeUpdate>) -> Result<NodeExecution>;

    /// Conditional status write. `allowed_from` of `None` uses the target's
    /// own [`Status::allowed_start_set`].
    async fn update_status(
        &self,
        id: &str,
        status: Status,
        ops: Vec<NodeUpdate>,
        allowed_from: Option<&[Status]>,
    ) -> Result<Option<NodeExecution>>;

    /// Move the given nodes to DISCONTINUING on behalf of `interrupt_id`.
    async fn mark_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        ids: &[String],
        interrupt_id: &str,
    ) -> Result<u64>;

    /// Move every live leaf in `statuses`, plus every node that never
    /// started, to DISCONTINUING on behalf of `interrupt_id`.
    async fn mark_all_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
        interrupt_id: &str,
    ) -> Result<u64>;

    /// Nodes in `status`, optionally restricted to those discontinued by
    /// `owner`.
    async fn fetch_by_status(
        &self,
        plan_execution_id: &str,
        status: Status,
        owner: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<NodeExecution>>;

    async fn fetch_without_old_retries_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
        page: PageRequest,
    ) -> Result<Page<NodeExecution>>;

    /// Live (not superseded) children of a node, in creation order.
    async fn fetch_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    /// Every node of a plan execution, superseded attempts included.
    async fn fetch_node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    async fn mark_retried(&self, id: &str) -> Result<()>;

    /// Point everything that referenced `old_id` as its predecessor at `new_id`.
    async fn update_relationships_for_retry(&self, old_id: &str, new_id: &str) -> Result<()>;
}

#[async_trait]
pub trait InterruptStore: Send + Sync {
    async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt>;

    async fn find_interrupt(&self, id: &str) -> Result<Option<Interrupt>>;

    async fn get_interrupt(&self, id: &str) -> Result<Interrupt> {
        self.find_interrupt(id)
            .await?
            .ok_or_else(|| arbor_types::ArborError::InterruptNotFound(id.to_string()))
    }

    /// REGISTERED → PROCESSING. `None` when someone else already started it.
    async fn mark_processing(&self, id: &str) -> Result<Option<Interrupt>>;

    async fn mark_processed(&self, id: &str, state: InterruptState) -> Result<Interrupt>;

    async fn fetch_interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>>;
}

#[async_trait]
pub trait ChildInstanceStore: Send + Sync {
    async fn save_child_instance(&self, instance: ConcurrentChildInstance) -> Result<()>;

    async fn find_child_instance(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>>;

    /// Claim the next unstarted child: returns its id and moves the cursor,
    /// or `None` once every child was claimed.
    async fn advance_cursor(&self, parent_id: &str) -> Result<Option<String>>;

    /// Claim every unstarted child at once.
    async fn exhaust_cursor(&self, parent_id: &str) -> Result<Vec<String>>;

    async fn delete_child_instance(&self, parent_id: &str) -> Result<()>;
}

#[async_trait]
pub trait InputInstanceStore: Send + Sync {
    async fn save_input_instance(&self, instance: ExecutionInputInstance) -> Result<()>;

    async fn find_input_instance(&self, input_instance_id: &str)
        -> Result<Option<ExecutionInputInstance>>;

    async fn find_input_instance_by_node(
        &self,
        node_execution_id: &str,
    ) -> Result<Option<ExecutionInputInstance>>;

    /// Record the user's input; succeeds only for the first caller.
    async fn complete_input_instance(
        &self,
        input_instance_id: &str,
        user_input: String,
        merged: serde_json::Value,
    ) -> Result<bool>;
}

#[async_trait]
pub trait OutputStore: Send + Sync {
    async fn save_output(&self, output: SweepingOutput) -> Result<()>;

    /// Outputs of a plan execution, optionally limited to some producers.
    async fn fetch_outputs(
        &self,
        plan_execution_id: &str,
        producer_ids: Option<&[String]>,
    ) -> Result<Vec<SweepingOutput>>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save_plan(&self, plan: Plan) -> Result<()>;

    async fn find_plan(&self, plan_id: &str) -> Result<Option<Plan>>;

    async fn fetch_plan_node(&self, plan_id: &str, node_id: &str) -> Result<PlanNode>;
}

#[async_trait]
pub trait PlanExecutionStore: Send + Sync {
    async fn save_plan_execution(&self, execution: PlanExecution) -> Result<()>;

    async fn find_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>>;

    async fn get_plan_execution(&self, id: &str) -> Result<PlanExecution> {
        self.find_plan_execution(id)
            .await?
            .ok_or_else(|| arbor_types::ArborError::PlanExecutionNotFound(id.to_string()))
    }

    /// Conditional status write, same contract as node status writes.
    async fn update_plan_execution_status(
        &self,
        id: &str,
        status: Status,
        allowed_from: &[Status],
    ) -> Result<Option<PlanExecution>>;

    async fn count_running_executions(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> Result<u64>;

    /// Queued executions of one pipeline, oldest first.
    async fn fetch_queued_executions(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> Result<Vec<PlanExecution>>;
}

/// Everything the engine persists.
pub trait ExecutionStore:
    NodeExecutionStore
    + InterruptStore
    + ChildInstanceStore
    + InputInstanceStore
    + OutputStore
    + PlanStore
    + PlanExecutionStore
{
}

impl<T> ExecutionStore for T where
    T: NodeExecutionStore
        + InterruptStore
        + ChildInstanceStore
        + InputInstanceStore
        + OutputStore
        + PlanStore
        + PlanExecutionStore
{
}
