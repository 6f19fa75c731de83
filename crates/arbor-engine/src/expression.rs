//! Late-bound `<+...>` expressions in step parameters and execution input.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use arbor_types::{Ambiance, Result, SweepingOutput};

use crate::store::{ExecutionStore, OutputStore};

#[async_trait]
pub trait ExpressionResolver: Send + Sync {
    /// Substitute every expression this resolver knows. Unknown expressions
    /// are left in place.
    async fn resolve(&self, ambiance: &Ambiance, text: &str) -> Result<String>;
}

/// Resolve every string inside a JSON value.
pub async fn resolve_value(
    resolver: &dyn ExpressionResolver,
    ambiance: &Ambiance,
    value: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut out = value.clone();
    let mut stack = vec![&mut out];
    while let Some(v) = stack.pop() {
        match v {
            serde_json::Value::String(s) => {
                let resolved = resolver.resolve(ambiance, s).await?;
                *s = resolved;
            }
            serde_json::Value::Array(items) => stack.extend(items.iter_mut()),
            serde_json::Value::Object(map) => stack.extend(map.values_mut()),
            _ => {}
        }
    }
    Ok(out)
}

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<\+([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)>")
            .expect("expression pattern is valid")
    })
}

/// Resolves scope identifiers from the ambiance and `<+outputs.NAME.path>`
/// from sweeping outputs of the current plan execution.
pub struct EngineExpressionResolver {
    store: Arc<dyn ExecutionStore>,
}

impl EngineExpressionResolver {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExpressionResolver for EngineExpressionResolver {
    async fn resolve(&self, ambiance: &Ambiance, text: &str) -> Result<String> {
        let pattern = expression_pattern();
        if !pattern.is_match(text) {
            return Ok(text.to_string());
        }

        let outputs = if text.contains("<+outputs.") {
            self.store
                .fetch_outputs(ambiance.plan_execution_id(), None)
                .await?
        } else {
            Vec::new()
        };

        let resolved = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
            lookup(ambiance, &outputs, &caps[1]).unwrap_or_else(|| caps[0].to_string())
        });
        Ok(resolved.into_owned())
    }
}

fn lookup(ambiance: &Ambiance, outputs: &[SweepingOutput], path: &str) -> Option<String> {
    match path {
        "pipeline.executionId" => return Some(ambiance.plan_execution_id().to_string()),
        "account.accountId" => return Some(ambiance.account_id().to_string()),
        "org.identifier" => return Some(ambiance.org_identifier().to_string()),
        "project.identifier" => return Some(ambiance.project_identifier().to_string()),
        "node.identifier" => return Some(ambiance.current_level().identifier.clone()),
        _ => {}
    }

    let rest = path.strip_prefix("outputs.")?;
    let mut segments = rest.split('.');
    let name = segments.next()?;
    // latest output with that name wins
    let output = outputs.iter().rev().find(|o| o.name == name)?;
    let mut value = &output.value;
    for segment in segments {
        value = match value {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, OutputStore};
    use arbor_types::{ambiance, Level, StepCategory, StepType};
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        let mut setup = BTreeMap::new();
        setup.insert(ambiance::ACCOUNT_ID.to_string(), "acc1".to_string());
        setup.insert(ambiance::ORG_IDENTIFIER.to_string(), "default".to_string());
        setup.insert(ambiance::PROJECT_IDENTIFIER.to_string(), "web".to_string());
        Ambiance::new(
            "pe1",
            "plan1",
            setup,
            Level::new("n1", "n1", "deploy", StepType::new("sync", StepCategory::Step)),
        )
    }

    async fn resolver_with_output() -> EngineExpressionResolver {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_output(SweepingOutput {
                uuid: "o1".into(),
                plan_execution_id: "pe1".into(),
                producer_id: "b1".into(),
                name: "build".into(),
                group: None,
                value: serde_json::json!({ "image": { "tag": "1.4.2" }, "replicas": 3 }),
                created_at: 0,
            })
            .await
            .unwrap();
        EngineExpressionResolver::new(store)
    }

    #[tokio::test]
    async fn resolves_scope_identifiers() {
        let resolver = resolver_with_output().await;
        let out = resolver
            .resolve(
                &ambiance(),
                "<+account.accountId>/<+org.identifier>/<+project.identifier>/\
                 <+pipeline.executionId>/<+node.identifier>",
            )
            .await
            .unwrap();
        assert_eq!(out, "acc1/default/web/pe1/deploy");
    }

    #[tokio::test]
    async fn resolves_output_paths() {
        let resolver = resolver_with_output().await;
        let out = resolver
            .resolve(&ambiance(), "tag=<+outputs.build.image.tag> n=<+outputs.build.replicas>")
            .await
            .unwrap();
        assert_eq!(out, "tag=1.4.2 n=3");
    }

    #[tokio::test]
    async fn unknown_expressions_are_left_alone() {
        let resolver = resolver_with_output().await;
        let text = "env: <+input>.allowedValues(dev,prod) tag: <+outputs.missing.x>";
        assert_eq!(resolver.resolve(&ambiance(), text).await.unwrap(), text);
    }

    #[tokio::test]
    async fn resolve_value_walks_nested_json() {
        let resolver = resolver_with_output().await;
        let value = serde_json::json!({
            "image": "<+outputs.build.image.tag>",
            "args": ["--account", "<+account.accountId>"],
            "count": 2
        });
        let out = resolve_value(&resolver, &ambiance(), &value).await.unwrap();
        assert_eq!(out["image"], "1.4.2");
        assert_eq!(out["args"][1], "acc1");
        assert_eq!(out["count"], 2);
    }
}
