//! In-memory store backed by [`DashMap`].
//!
//! Each operation touches one entry under its shard lock, which gives the
//! same single-record atomicity a document database offers. The whole store,
//! together with the engine's outstanding waits, can be written to a JSON
//! snapshot and restored so a local run picks up where it stopped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use arbor_types::{
    now_millis, ArborError, ConcurrentChildInstance, ExecutionInputInstance, Interrupt,
    InterruptState, NodeExecution, PlanExecution, Result, Status, SweepingOutput,
};

use super::{
    ChildInstanceStore, InputInstanceStore, InterruptStore, NodeExecutionStore, NodeUpdate,
    OutputStore, Page, PageRequest, PlanExecutionStore, PlanStore,
};
use crate::plan::{Plan, PlanNode};
use crate::wait_notify::WaitSnapshot;

/// Value plus its insertion sequence, used for stable ordering.
#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    value: T,
}

#[derive(Default)]
pub struct InMemoryStore {
    seq: AtomicU64,
    nodes: DashMap<String, Stored<NodeExecution>>,
    interrupts: DashMap<String, Stored<Interrupt>>,
    child_instances: DashMap<String, ConcurrentChildInstance>,
    input_instances: DashMap<String, Stored<ExecutionInputInstance>>,
    outputs: DashMap<String, Stored<SweepingOutput>>,
    plans: DashMap<String, Plan>,
    plan_executions: DashMap<String, Stored<PlanExecution>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn stored<T>(&self, value: T) -> Stored<T> {
        Stored {
            seq: self.next_seq(),
            value,
        }
    }
}

/// Sort by insertion order and drop the wrapper.
fn in_order<T>(mut items: Vec<Stored<T>>) -> Vec<T> {
    items.sort_by_key(|s| s.seq);
    items.into_iter().map(|s| s.value).collect()
}

fn discontinue(node: &mut NodeExecution, interrupt_id: &str) -> bool {
    if !Status::Discontinuing.allowed_start_set().contains(&node.status) {
        return false;
    }
    node.status = Status::Discontinuing;
    node.discontinued_by = Some(interrupt_id.to_string());
    node.last_updated_at = now_millis();
    true
}

// ---------------------------------------------------------------------------
// Node executions
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeExecutionStore for InMemoryStore {
    async fn insert_node_execution(&self, node: NodeExecution) -> Result<bool> {
        let mut inserted = false;
        self.nodes.entry(node.uuid.clone()).or_insert_with(|| {
            inserted = true;
            self.stored(node)
        });
        Ok(inserted)
    }

    async fn find_node_execution(&self, id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.nodes.get(id).map(|e| e.value.clone()))
    }

    async fn update_node_execution(&self, id: &str, ops: Vec<NodeUpdate>) -> Result<NodeExecution> {
        let mut entry = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ArborError::NodeExecutionNotFound(id.to_string()))?;
        let node = &mut entry.value;
        for op in &ops {
            op.apply(node);
        }
        node.last_updated_at = now_millis();
        Ok(node.clone())
    }

    async fn update_status(
        &self,
        id: &str,
        status: Status,
        ops: Vec<NodeUpdate>,
        allowed_from: Option<&[Status]>,
    ) -> Result<Option<NodeExecution>> {
        let mut entry = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ArborError::NodeExecutionNotFound(id.to_string()))?;
        let node = &mut entry.value;
        let allowed = match allowed_from {
            Some(set) => set.contains(&node.status),
            None => status.allowed_start_set().contains(&node.status),
        };
        if !allowed {
            return Ok(None);
        }
        node.status = status;
        for op in &ops {
            op.apply(node);
        }
        node.last_updated_at = now_millis();
        Ok(Some(node.clone()))
    }

    async fn mark_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        ids: &[String],
        interrupt_id: &str,
    ) -> Result<u64> {
        let mut count = 0;
        for id in ids {
            if let Some(mut entry) = self.nodes.get_mut(id) {
                let node = &mut entry.value;
                if node.plan_execution_id() == plan_execution_id
                    && discontinue(node, interrupt_id)
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn mark_all_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
        interrupt_id: &str,
    ) -> Result<u64> {
        let not_started = Status::not_started_statuses();
        let mut count = 0;
        for mut entry in self.nodes.iter_mut() {
            let node = &mut entry.value;
            if node.plan_execution_id() != plan_execution_id || node.old_retry {
                continue;
            }
            let leaf_match = node.is_leaf() && statuses.contains(&node.status);
            if (leaf_match || not_started.contains(&node.status)) && discontinue(node, interrupt_id)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fetch_by_status(
        &self,
        plan_execution_id: &str,
        status: Status,
        owner: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<NodeExecution>> {
        let matching: Vec<_> = self
            .nodes
            .iter()
            .filter(|e| {
                let n = &e.value;
                n.plan_execution_id() == plan_execution_id
                    && n.status == status
                    && owner.map_or(true, |o| n.discontinued_by.as_deref() == Some(o))
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(Page::from_sorted(in_order(matching), page))
    }

    async fn fetch_without_old_retries_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
        page: PageRequest,
    ) -> Result<Page<NodeExecution>> {
        let matching: Vec<_> = self
            .nodes
            .iter()
            .filter(|e| {
                let n = &e.value;
                n.plan_execution_id() == plan_execution_id
                    && !n.old_retry
                    && statuses.contains(&n.status)
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(Page::from_sorted(in_order(matching), page))
    }

    async fn fetch_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        let matching: Vec<_> = self
            .nodes
            .iter()
            .filter(|e| e.value.parent_id.as_deref() == Some(parent_id) && !e.value.old_retry)
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching))
    }

    async fn fetch_node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let matching: Vec<_> = self
            .nodes
            .iter()
            .filter(|e| e.value.plan_execution_id() == plan_execution_id)
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching))
    }

    async fn mark_retried(&self, id: &str) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ArborError::NodeExecutionNotFound(id.to_string()))?;
        entry.value.old_retry = true;
        entry.value.last_updated_at = now_millis();
        Ok(())
    }

    async fn update_relationships_for_retry(&self, old_id: &str, new_id: &str) -> Result<()> {
        for mut entry in self.nodes.iter_mut() {
            if entry.value.previous_id.as_deref() == Some(old_id) {
                entry.value.previous_id = Some(new_id.to_string());
            }
        }
        for mut entry in self.child_instances.iter_mut() {
            for child in entry.children_node_execution_ids.iter_mut() {
                if child == old_id {
                    *child = new_id.to_string();
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

#[async_trait]
impl InterruptStore for InMemoryStore {
    async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt> {
        let entry = self
            .interrupts
            .entry(interrupt.uuid.clone())
            .or_insert_with(|| self.stored(interrupt));
        Ok(entry.value.clone())
    }

    async fn find_interrupt(&self, id: &str) -> Result<Option<Interrupt>> {
        Ok(self.interrupts.get(id).map(|e| e.value.clone()))
    }

    async fn mark_processing(&self, id: &str) -> Result<Option<Interrupt>> {
        let mut entry = self
            .interrupts
            .get_mut(id)
            .ok_or_else(|| ArborError::InterruptNotFound(id.to_string()))?;
        if entry.value.state != InterruptState::Registered {
            return Ok(None);
        }
        entry.value.state = InterruptState::Processing;
        Ok(Some(entry.value.clone()))
    }

    async fn mark_processed(&self, id: &str, state: InterruptState) -> Result<Interrupt> {
        let mut entry = self
            .interrupts
            .get_mut(id)
            .ok_or_else(|| ArborError::InterruptNotFound(id.to_string()))?;
        entry.value.state = state;
        Ok(entry.value.clone())
    }

    async fn fetch_interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        let matching: Vec<_> = self
            .interrupts
            .iter()
            .filter(|e| e.value.plan_execution_id == plan_execution_id)
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching))
    }
}

// ---------------------------------------------------------------------------
// Fan-out bookkeeping
// ---------------------------------------------------------------------------

#[async_trait]
impl ChildInstanceStore for InMemoryStore {
    async fn save_child_instance(&self, instance: ConcurrentChildInstance) -> Result<()> {
        self.child_instances
            .insert(instance.parent_node_execution_id.clone(), instance);
        Ok(())
    }

    async fn find_child_instance(
        &self,
        parent_id: &str,
    ) -> Result<Option<ConcurrentChildInstance>> {
        Ok(self.child_instances.get(parent_id).map(|e| e.value().clone()))
    }

    async fn advance_cursor(&self, parent_id: &str) -> Result<Option<String>> {
        let Some(mut entry) = self.child_instances.get_mut(parent_id) else {
            return Ok(None);
        };
        let cursor = entry.cursor;
        let next = entry.children_node_execution_ids.get(cursor).cloned();
        if next.is_some() {
            entry.cursor = cursor + 1;
        }
        Ok(next)
    }

    async fn exhaust_cursor(&self, parent_id: &str) -> Result<Vec<String>> {
        let Some(mut entry) = self.child_instances.get_mut(parent_id) else {
            return Ok(Vec::new());
        };
        let len = entry.children_node_execution_ids.len();
        let cursor = entry.cursor.min(len);
        let rest = entry.children_node_execution_ids[cursor..].to_vec();
        entry.cursor = len;
        Ok(rest)
    }

    async fn delete_child_instance(&self, parent_id: &str) -> Result<()> {
        self.child_instances.remove(parent_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution input
// ---------------------------------------------------------------------------

#[async_trait]
impl InputInstanceStore for InMemoryStore {
    async fn save_input_instance(&self, instance: ExecutionInputInstance) -> Result<()> {
        let stored = self.stored(instance);
        self.input_instances
            .insert(stored.value.input_instance_id.clone(), stored);
        Ok(())
    }

    async fn find_input_instance(
        &self,
        input_instance_id: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        Ok(self
            .input_instances
            .get(input_instance_id)
            .map(|e| e.value.clone()))
    }

    async fn find_input_instance_by_node(
        &self,
        node_execution_id: &str,
    ) -> Result<Option<ExecutionInputInstance>> {
        let matching: Vec<_> = self
            .input_instances
            .iter()
            .filter(|e| e.value.node_execution_id == node_execution_id)
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching).pop())
    }

    async fn complete_input_instance(
        &self,
        input_instance_id: &str,
        user_input: String,
        merged: serde_json::Value,
    ) -> Result<bool> {
        let mut entry = self
            .input_instances
            .get_mut(input_instance_id)
            .ok_or_else(|| ArborError::InputInstanceNotFound(input_instance_id.to_string()))?;
        if entry.value.is_completed() {
            return Ok(false);
        }
        entry.value.user_input = Some(user_input);
        entry.value.merged_input_template = Some(merged);
        entry.value.completed_at = Some(now_millis());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Outputs, plans, plan executions
// ---------------------------------------------------------------------------

#[async_trait]
impl OutputStore for InMemoryStore {
    async fn save_output(&self, output: SweepingOutput) -> Result<()> {
        let stored = self.stored(output);
        self.outputs.insert(stored.value.uuid.clone(), stored);
        Ok(())
    }

    async fn fetch_outputs(
        &self,
        plan_execution_id: &str,
        producer_ids: Option<&[String]>,
    ) -> Result<Vec<SweepingOutput>> {
        let matching: Vec<_> = self
            .outputs
            .iter()
            .filter(|e| {
                e.value.plan_execution_id == plan_execution_id
                    && producer_ids.map_or(true, |ids| ids.contains(&e.value.producer_id))
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching))
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn save_plan(&self, plan: Plan) -> Result<()> {
        self.plans.insert(plan.uuid.clone(), plan);
        Ok(())
    }

    async fn find_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        Ok(self.plans.get(plan_id).map(|plan| plan.clone()))
    }

    async fn fetch_plan_node(&self, plan_id: &str, node_id: &str) -> Result<PlanNode> {
        self.plans
            .get(plan_id)
            .and_then(|plan| plan.node(node_id).cloned())
            .ok_or_else(|| ArborError::PlanNodeNotFound {
                plan: plan_id.to_string(),
                node: node_id.to_string(),
            })
    }
}

#[async_trait]
impl PlanExecutionStore for InMemoryStore {
    async fn save_plan_execution(&self, execution: PlanExecution) -> Result<()> {
        let stored = self.stored(execution);
        self.plan_executions.insert(stored.value.uuid.clone(), stored);
        Ok(())
    }

    async fn find_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>> {
        Ok(self.plan_executions.get(id).map(|e| e.value.clone()))
    }

    async fn update_plan_execution_status(
        &self,
        id: &str,
        status: Status,
        allowed_from: &[Status],
    ) -> Result<Option<PlanExecution>> {
        let mut entry = self
            .plan_executions
            .get_mut(id)
            .ok_or_else(|| ArborError::PlanExecutionNotFound(id.to_string()))?;
        if !allowed_from.contains(&entry.value.status) {
            return Ok(None);
        }
        entry.value.status = status;
        if status.is_final() {
            entry.value.end_ts = Some(now_millis());
        }
        Ok(Some(entry.value.clone()))
    }

    async fn count_running_executions(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> Result<u64> {
        let count = self
            .plan_executions
            .iter()
            .filter(|e| {
                let pe = &e.value;
                pe.account_id == account_id
                    && pe.org_identifier == org_identifier
                    && pe.project_identifier == project_identifier
                    && pe.pipeline_identifier == pipeline_identifier
                    && pe.status != Status::Queued
                    && !pe.status.is_final()
            })
            .count();
        Ok(count as u64)
    }

    async fn fetch_queued_executions(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> Result<Vec<PlanExecution>> {
        let matching: Vec<_> = self
            .plan_executions
            .iter()
            .filter(|e| {
                let pe = &e.value;
                pe.account_id == account_id
                    && pe.org_identifier == org_identifier
                    && pe.project_identifier == project_identifier
                    && pe.pipeline_identifier == pipeline_identifier
                    && pe.status == Status::Queued
            })
            .map(|e| e.value().clone())
            .collect();
        Ok(in_order(matching))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serialisable copy of the whole store, each collection in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub plans: Vec<Plan>,
    pub plan_executions: Vec<PlanExecution>,
    pub node_executions: Vec<NodeExecution>,
    pub interrupts: Vec<Interrupt>,
    pub child_instances: Vec<ConcurrentChildInstance>,
    pub input_instances: Vec<ExecutionInputInstance>,
    pub outputs: Vec<SweepingOutput>,
    /// Callbacks the engine was still waiting on when the snapshot was taken.
    #[serde(default)]
    pub waits: WaitSnapshot,
    pub timestamp: String,
}

fn collect<T: Clone>(map: &DashMap<String, Stored<T>>) -> Vec<T> {
    in_order(map.iter().map(|e| e.value().clone()).collect())
}

impl InMemoryStore {
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut child_instances: Vec<_> = self
            .child_instances
            .iter()
            .map(|e| e.value().clone())
            .collect();
        child_instances.sort_by(|a, b| a.parent_node_execution_id.cmp(&b.parent_node_execution_id));
        let mut plans: Vec<_> = self.plans.iter().map(|e| e.value().clone()).collect();
        plans.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        StoreSnapshot {
            plans,
            plan_executions: collect(&self.plan_executions),
            node_executions: collect(&self.nodes),
            interrupts: collect(&self.interrupts),
            child_instances,
            input_instances: collect(&self.input_instances),
            outputs: collect(&self.outputs),
            waits: WaitSnapshot::default(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn restore(snapshot: StoreSnapshot) -> Self {
        let store = InMemoryStore::new();
        for plan in snapshot.plans {
            store.plans.insert(plan.uuid.clone(), plan);
        }
        for pe in snapshot.plan_executions {
            store.plan_executions.insert(pe.uuid.clone(), store.stored(pe));
        }
        for node in snapshot.node_executions {
            store.nodes.insert(node.uuid.clone(), store.stored(node));
        }
        for interrupt in snapshot.interrupts {
            store
                .interrupts
                .insert(interrupt.uuid.clone(), store.stored(interrupt));
        }
        for ci in snapshot.child_instances {
            store
                .child_instances
                .insert(ci.parent_node_execution_id.clone(), ci);
        }
        for ii in snapshot.input_instances {
            store
                .input_instances
                .insert(ii.input_instance_id.clone(), store.stored(ii));
        }
        for out in snapshot.outputs {
            store.outputs.insert(out.uuid.clone(), store.stored(out));
        }
        store
    }

    /// Write the snapshot, with `waits`, to `<dir>/store.json`, creating
    /// `dir` if needed.
    pub async fn save_snapshot(&self, dir: &Path, waits: WaitSnapshot) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("store.json");
        let mut snapshot = self.snapshot();
        snapshot.waits = waits;
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(
            path = %path.display(),
            waits = snapshot.waits.pending_waits(),
            "Store snapshot saved"
        );
        Ok(path)
    }

    /// Read `<dir>/store.json`; `Ok(None)` when no snapshot exists.
    pub async fn load_snapshot(dir: &Path) -> Result<Option<StoreSnapshot>> {
        let path = dir.join("store.json");
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
