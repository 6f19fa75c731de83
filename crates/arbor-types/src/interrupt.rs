use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    AbortAll,
    ExpireAll,
    MarkExpired,
    MarkFailed,
    Retry,
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::ExpireAll => "EXPIRE_ALL",
            InterruptType::MarkExpired => "MARK_EXPIRED",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::Retry => "RETRY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    Manual { identifier: String },
    Timeout { timeout_instance_id: String },
    System,
}

/// Who asked for the interrupt and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub issued_by: IssuedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub issue_time: i64,
}

impl InterruptConfig {
    pub fn manual(identifier: impl Into<String>) -> Self {
        Self {
            issued_by: IssuedBy::Manual {
                identifier: identifier.into(),
            },
            reason: None,
            issue_time: crate::now_millis(),
        }
    }

    pub fn system() -> Self {
        Self {
            issued_by: IssuedBy::System,
            reason: None,
            issue_time: crate::now_millis(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub uuid: String,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    /// Target node; when absent the interrupt covers the whole plan execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub interrupt_config: InterruptConfig,
    pub state: InterruptState,
    pub created_at: i64,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: Option<String>,
        interrupt_config: InterruptConfig,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id,
            interrupt_config,
            state: InterruptState::Registered,
            created_at: crate::now_millis(),
        }
    }
}
