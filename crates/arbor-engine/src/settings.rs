//! Admission control: whether a new plan execution must queue, and how wide
//! a fan-out may run, both decided by the account's edition.

use std::sync::Arc;

use arbor_types::{ArborError, Result};

use crate::config::OrchestrationRestrictionConfig;
use crate::license::{Edition, EditionCache};
use crate::store::{ExecutionStore, PlanExecutionStore};

/// Fan-out ceiling when the edition cannot be determined.
pub const FALLBACK_MAX_CONCURRENCY: u64 = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanExecutionSettingResponse {
    pub should_queue: bool,
    /// Set whenever a restriction was evaluated for the edition.
    pub use_new_flow: bool,
}

pub struct PipelineSettingsService {
    restrictions: OrchestrationRestrictionConfig,
    editions: Arc<EditionCache>,
    store: Arc<dyn ExecutionStore>,
}

impl PipelineSettingsService {
    pub fn new(
        restrictions: OrchestrationRestrictionConfig,
        editions: Arc<EditionCache>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            restrictions,
            editions,
            store,
        }
    }

    /// Never fails: any lookup error means "do not queue".
    pub async fn should_queue_plan_execution(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> PlanExecutionSettingResponse {
        match self
            .try_should_queue(account_id, org_identifier, project_identifier, pipeline_identifier)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    account = %account_id,
                    pipeline = %pipeline_identifier,
                    error = %e,
                    "Admission check failed, running without queueing"
                );
                PlanExecutionSettingResponse::default()
            }
        }
    }

    async fn try_should_queue(
        &self,
        account_id: &str,
        org_identifier: &str,
        project_identifier: &str,
        pipeline_identifier: &str,
    ) -> Result<PlanExecutionSettingResponse> {
        let edition = self.editions.edition(account_id).await?;
        if !self.restrictions.uses_restriction(edition) {
            return Ok(PlanExecutionSettingResponse::default());
        }
        let max_running = self
            .restrictions
            .plan_execution_restriction
            .for_edition(edition);
        let running = self
            .store
            .count_running_executions(
                account_id,
                org_identifier,
                project_identifier,
                pipeline_identifier,
            )
            .await?;
        tracing::debug!(
            account = %account_id,
            pipeline = %pipeline_identifier,
            %edition,
            running,
            max_running,
            "Admission evaluated"
        );
        Ok(PlanExecutionSettingResponse {
            should_queue: running >= max_running,
            use_new_flow: true,
        })
    }

    /// Pipelines an account may create; unlimited when unrestricted or unknown.
    pub async fn max_pipeline_creation_count(&self, account_id: &str) -> u64 {
        match self.editions.edition(account_id).await {
            Ok(edition) if self.restrictions.uses_restriction(edition) => self
                .restrictions
                .pipeline_creation_restriction
                .for_edition(edition),
            Ok(_) => u64::MAX,
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e, "Edition lookup failed");
                u64::MAX
            }
        }
    }

    /// Effective fan-out bound for `child_count` children.
    ///
    /// Rejects the request when `child_count` is above the edition's hard
    /// stop. Unrestricted editions get a fixed default per edition.
    pub async fn max_concurrency_based_on_edition(
        &self,
        account_id: &str,
        child_count: u64,
    ) -> Result<u64> {
        let edition = match self.editions.edition(account_id).await {
            Ok(edition) => edition,
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e, "Edition lookup failed");
                return Ok(FALLBACK_MAX_CONCURRENCY);
            }
        };
        if !self.restrictions.uses_restriction(edition) {
            return Ok(default_max_concurrency(edition));
        }

        let stop = self
            .restrictions
            .total_parallelism_stop_restriction
            .for_edition(edition);
        if child_count > stop {
            return Err(ArborError::ConcurrencyLimitExceeded {
                limit: stop,
                message: over_limit_message(edition, stop),
            });
        }
        Ok(self
            .restrictions
            .max_concurrency_restriction
            .for_edition(edition))
    }
}

fn default_max_concurrency(edition: Edition) -> u64 {
    match edition {
        Edition::Free => 20,
        Edition::Team => 50,
        Edition::Enterprise => 100,
    }
}

fn over_limit_message(edition: Edition, stop: u64) -> String {
    let advice = match edition {
        Edition::Free => "Please upgrade your plan to team or reduce concurrency",
        Edition::Team => "Please upgrade your plan to enterprise or reduce concurrency",
        Edition::Enterprise => "Please contact sales if you want to run more",
    };
    format!("Trying to run more than {stop} concurrent stages/steps. {advice}")
}
