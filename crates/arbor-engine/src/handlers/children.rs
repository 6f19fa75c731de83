//! Handlers that wait on child nodes.

use async_trait::async_trait;

use arbor_types::{ArborError, ExecutableResponse, Result};

use crate::handler::{StepContext, StepHandler, Work};

/// Runs the single node named by the `child` parameter.
pub struct ChildHandler;

#[async_trait]
impl StepHandler for ChildHandler {
    fn step_type(&self) -> &str {
        "child"
    }

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        let child_node_id = ctx.plan_node.child_node_id().ok_or_else(|| {
            ArborError::HandlerError {
                step_type: self.step_type().into(),
                node: ctx.node_execution.uuid.clone(),
                message: "missing 'child' parameter".into(),
            }
        })?;
        Ok(Work::Await(ExecutableResponse::Child {
            child_node_id: child_node_id.to_string(),
        }))
    }
}

/// Fans out over the `children` parameter.
///
/// `max_concurrency` (0 or absent means the admission ceiling) and
/// `proceed_if_failed` are read from the resolved parameters.
pub struct ChildrenHandler;

#[async_trait]
impl StepHandler for ChildrenHandler {
    fn step_type(&self) -> &str {
        "children"
    }

    async fn obtain_work(&self, ctx: &StepContext) -> Result<Work> {
        let children = ctx.plan_node.child_specs()?;
        let max_concurrency = ctx
            .parameters
            .get("max_concurrency")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let proceed_if_failed = ctx
            .parameters
            .get("proceed_if_failed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Work::Await(ExecutableResponse::Children {
            children,
            max_concurrency,
            proceed_if_failed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::ctx;

    #[tokio::test]
    async fn child_requires_parameter() {
        let c = ctx(serde_json::Value::Null);
        let err = ChildHandler.obtain_work(&c).await.unwrap_err();
        assert!(err.to_string().contains("missing 'child' parameter"));

        let mut c = ctx(serde_json::Value::Null);
        c.plan_node.step_parameters = serde_json::json!({ "child": "stage1" });
        assert_eq!(
            ChildHandler.obtain_work(&c).await.unwrap(),
            Work::Await(ExecutableResponse::Child {
                child_node_id: "stage1".into()
            })
        );
    }

    #[tokio::test]
    async fn children_reads_concurrency_settings() {
        let mut c = ctx(serde_json::json!({ "max_concurrency": 2, "proceed_if_failed": true }));
        c.plan_node.step_parameters = serde_json::json!({ "children": ["a", "b", "c"] });
        let Work::Await(ExecutableResponse::Children {
            children,
            max_concurrency,
            proceed_if_failed,
        }) = ChildrenHandler.obtain_work(&c).await.unwrap()
        else {
            panic!("expected a children wait");
        };
        assert_eq!(children.len(), 3);
        assert_eq!(max_concurrency, 2);
        assert!(proceed_if_failed);
    }

    #[tokio::test]
    async fn children_defaults_to_ceiling() {
        let mut c = ctx(serde_json::Value::Null);
        c.plan_node.step_parameters = serde_json::json!({ "children": [] });
        let Work::Await(ExecutableResponse::Children {
            children,
            max_concurrency,
            proceed_if_failed,
        }) = ChildrenHandler.obtain_work(&c).await.unwrap()
        else {
            panic!("expected a children wait");
        };
        assert!(children.is_empty());
        assert_eq!(max_concurrency, 0);
        assert!(!proceed_if_failed);
    }
}
