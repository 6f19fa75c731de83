//! Execution core for hierarchical plans.
//!
//! This crate drives node executions through their lifecycle: handler
//! dispatch, wait/notify resumption, bounded child fan-out, edition-based
//! admission control, interrupt propagation (abort, expire, mark-failed,
//! retry), and execution input that parks a node until a user supplies it.

pub mod config;
pub mod engine;
pub mod events;
pub mod execution_input;
pub mod expression;
mod fanout;
pub mod fqn;
pub mod handler;
pub mod handlers;
pub mod interrupts;
pub mod license;
pub mod plan;
pub mod resume;
pub mod retry;
pub mod settings;
pub mod store;
pub mod validation;
pub mod wait_notify;

pub use config::{EditionLimits, EngineConfig, FeatureFlags, OrchestrationRestrictionConfig};
pub use engine::{InitiateMode, OrchestrationEngine, StartRequest};
pub use events::{EventEmitter, OrchestrationEvent};
pub use execution_input::ExecutionInputService;
pub use expression::{EngineExpressionResolver, ExpressionResolver};
pub use handler::{
    aggregate, default_registry, DynHandler, HandlerRegistry, StepContext, StepHandler, Work,
};
pub use handlers::{QueuedTask, QueuedTaskExecutor, TaskExecutor};
pub use interrupts::{InterruptHandler, InterruptManager};
pub use license::{Edition, EditionCache, LicenseClient, ModuleLicense, StaticLicenseClient};
pub use plan::{FacilitatorType, FailureStrategy, Plan, PlanNode};
pub use settings::{PipelineSettingsService, PlanExecutionSettingResponse};
pub use store::{ExecutionStore, InMemoryStore, NodeUpdate, Page, PageRequest, StoreSnapshot};
pub use validation::{validate, validate_or_raise, Diagnostic, Severity};
pub use wait_notify::{
    EngineEvent, NotifyCallback, ResponseData, WaitNotifyEngine, WaitSnapshot, WorkQueue,
};
