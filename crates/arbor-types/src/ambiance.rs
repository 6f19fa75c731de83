//! Ambiance: where in one plan execution a unit of work lives.
//!
//! An [`Ambiance`] is an append-only chain of [`Level`]s. The last level is
//! the current node instance; descending into a child copies the chain and
//! appends one level. Nothing mutates a chain in place, so a value handed to
//! a spawned task can never observe a sibling's descent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ArborError;

pub const ACCOUNT_ID: &str = "accountId";
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stages,
    Stage,
    Step,
    Strategy,
    Fork,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    #[serde(rename = "type")]
    pub step_type: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(step_type: impl Into<String>, category: StepCategory) -> Self {
        Self {
            step_type: step_type.into(),
            category,
        }
    }
}

/// One node instance in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub runtime_id: String,
    /// Plan node id this instance was created from.
    pub setup_id: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_metadata: Option<serde_json::Value>,
}

impl Level {
    pub fn new(
        runtime_id: impl Into<String>,
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: setup_id.into(),
            identifier: identifier.into(),
            step_type,
            group: None,
            start_ts: crate::now_millis(),
            strategy_metadata: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_strategy_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.strategy_metadata = Some(metadata);
        self
    }
}

/// Immutable, non-empty chain of levels plus the plan execution it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "AmbianceRepr", try_from = "AmbianceRepr")]
pub struct Ambiance {
    plan_execution_id: String,
    plan_id: String,
    setup_abstractions: BTreeMap<String, String>,
    ancestors: Vec<Level>,
    current: Level,
}

impl Ambiance {
    /// Root ambiance of a plan execution.
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
        root: Level,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions,
            ancestors: Vec::new(),
            current: root,
        }
    }

    /// Returns a new chain with `level` appended. `self` is left untouched.
    pub fn descend(&self, level: Level) -> Ambiance {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.current.clone());
        Ambiance {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: self.setup_abstractions.clone(),
            ancestors,
            current: level,
        }
    }

    /// Same position with the current level swapped out, as used by a new
    /// attempt of the same node.
    pub fn replace_current(&self, level: Level) -> Ambiance {
        Ambiance {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: self.setup_abstractions.clone(),
            ancestors: self.ancestors.clone(),
            current: level,
        }
    }

    pub fn current_level(&self) -> &Level {
        &self.current
    }

    /// Levels from the root down to the current one.
    pub fn levels(&self) -> impl DoubleEndedIterator<Item = &Level> {
        self.ancestors.iter().chain(std::iter::once(&self.current))
    }

    pub fn depth(&self) -> usize {
        self.ancestors.len() + 1
    }

    /// The level `n` steps above the current one; `0` is the current level.
    pub fn level_from_top(&self, n: usize) -> Option<&Level> {
        self.levels().rev().nth(n)
    }

    /// Nearest level, scanning from the tail, whose group matches.
    pub fn nearest_level_by_group(&self, group: &str) -> Option<&Level> {
        self.levels()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }

    pub fn nearest_level_by_category(&self, category: StepCategory) -> Option<&Level> {
        self.levels()
            .rev()
            .find(|l| l.step_type.category == category)
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn setup_abstractions(&self) -> &BTreeMap<String, String> {
        &self.setup_abstractions
    }

    pub fn runtime_id(&self) -> &str {
        &self.current.runtime_id
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        self.ancestors.last().map(|l| l.runtime_id.as_str())
    }

    pub fn account_id(&self) -> &str {
        self.abstraction(ACCOUNT_ID)
    }

    pub fn org_identifier(&self) -> &str {
        self.abstraction(ORG_IDENTIFIER)
    }

    pub fn project_identifier(&self) -> &str {
        self.abstraction(PROJECT_IDENTIFIER)
    }

    pub fn current_level_start_ts(&self) -> i64 {
        self.current.start_ts
    }

    fn abstraction(&self, key: &str) -> &str {
        self.setup_abstractions
            .get(key)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct AmbianceRepr {
    plan_execution_id: String,
    plan_id: String,
    #[serde(default)]
    setup_abstractions: BTreeMap<String, String>,
    levels: Vec<Level>,
}

impl From<Ambiance> for AmbianceRepr {
    fn from(a: Ambiance) -> Self {
        let mut levels = a.ancestors;
        levels.push(a.current);
        AmbianceRepr {
            plan_execution_id: a.plan_execution_id,
            plan_id: a.plan_id,
            setup_abstractions: a.setup_abstractions,
            levels,
        }
    }
}

impl TryFrom<AmbianceRepr> for Ambiance {
    type Error = ArborError;

    fn try_from(mut repr: AmbianceRepr) -> Result<Self, Self::Error> {
        let current = repr.levels.pop().ok_or_else(|| {
            ArborError::InvalidRequest(format!(
                "ambiance for plan execution '{}' has no levels",
                repr.plan_execution_id
            ))
        })?;
        Ok(Ambiance {
            plan_execution_id: repr.plan_execution_id,
            plan_id: repr.plan_id,
            setup_abstractions: repr.setup_abstractions,
            ancestors: repr.levels,
            current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Ambiance {
        let mut abstractions = BTreeMap::new();
        abstractions.insert(ACCOUNT_ID.to_string(), "acc".to_string());
        Ambiance::new(
            "pe1",
            "plan1",
            abstractions,
            Level::new(
                "r0",
                "pipeline",
                "pipeline",
                StepType::new("pipeline", StepCategory::Pipeline),
            ),
        )
    }

    #[test]
    fn descend_appends_without_touching_original() {
        let a = root();
        let stage = Level::new("r1", "s1", "build", StepType::new("stage", StepCategory::Stage))
            .with_group("STAGE");
        let b = a.descend(stage);

        assert_eq!(a.depth(), 1);
        assert_eq!(b.depth(), 2);
        assert_eq!(a.runtime_id(), "r0");
        assert_eq!(b.runtime_id(), "r1");
        assert_eq!(b.parent_runtime_id(), Some("r0"));
        assert_eq!(a.parent_runtime_id(), None);
    }

    #[test]
    fn nearest_level_scans_from_tail() {
        let a = root()
            .descend(
                Level::new("r1", "s1", "build", StepType::new("stage", StepCategory::Stage))
                    .with_group("STAGE"),
            )
            .descend(Level::new(
                "r2",
                "st1",
                "compile",
                StepType::new("sync", StepCategory::Step),
            ));

        assert_eq!(a.nearest_level_by_group("STAGE").unwrap().identifier, "build");
        assert_eq!(
            a.nearest_level_by_category(StepCategory::Pipeline)
                .unwrap()
                .runtime_id,
            "r0"
        );
        assert_eq!(a.level_from_top(0).unwrap().runtime_id, "r2");
        assert_eq!(a.level_from_top(2).unwrap().runtime_id, "r0");
        assert!(a.level_from_top(3).is_none());
        assert!(a.nearest_level_by_group("MISSING").is_none());
    }

    #[test]
    fn replace_current_keeps_ancestors() {
        let a = root().descend(Level::new(
            "r1",
            "s1",
            "build",
            StepType::new("stage", StepCategory::Stage),
        ));
        let mut level = a.current_level().clone();
        level.runtime_id = "r1-retry".into();
        let b = a.replace_current(level);
        assert_eq!(b.depth(), 2);
        assert_eq!(b.runtime_id(), "r1-retry");
        assert_eq!(b.parent_runtime_id(), Some("r0"));
        assert_eq!(a.runtime_id(), "r1");
    }

    #[test]
    fn account_id_defaults_to_empty() {
        let a = root();
        assert_eq!(a.account_id(), "acc");
        assert_eq!(a.org_identifier(), "");
    }

    #[test]
    fn serializes_as_flat_levels() {
        let a = root().descend(Level::new(
            "r1",
            "s1",
            "build",
            StepType::new("stage", StepCategory::Stage),
        ));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["levels"].as_array().unwrap().len(), 2);
        assert_eq!(json["levels"][1]["runtime_id"], "r1");

        let back: Ambiance = serde_json::from_value(json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn empty_chain_is_rejected() {
        let json = serde_json::json!({
            "plan_execution_id": "pe1",
            "plan_id": "p",
            "levels": []
        });
        let err = serde_json::from_value::<Ambiance>(json).unwrap_err();
        assert!(err.to_string().contains("has no levels"));
    }
}
