//! Plan validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on any `Error`-severity issue before a plan is accepted by the engine.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::plan::{FacilitatorType, Plan};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic>;
}

fn error(rule: &str, node_id: Option<&str>, message: String, fix: Option<&str>) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        node_id: node_id.map(String::from),
        fix: fix.map(String::from),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct RootNodeRule;
impl LintRule for RootNodeRule {
    fn name(&self) -> &str {
        "root_node"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        if plan.root().is_some() {
            return vec![];
        }
        vec![error(
            self.name(),
            None,
            format!("Root node '{}' is not defined in the plan", plan.root_node_id),
            Some("Set root_node_id to the uuid of an existing node"),
        )]
    }
}

struct UniqueNodeIdsRule;
impl LintRule for UniqueNodeIdsRule {
    fn name(&self) -> &str {
        "unique_node_ids"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        plan.nodes
            .iter()
            .filter(|n| !seen.insert(n.uuid.as_str()))
            .map(|n| {
                error(
                    self.name(),
                    Some(&n.uuid),
                    format!("Node id '{}' is declared more than once", n.uuid),
                    None,
                )
            })
            .collect()
    }
}

struct ChildParametersRule;
impl LintRule for ChildParametersRule {
    fn name(&self) -> &str {
        "child_parameters"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in &plan.nodes {
            match node.facilitator {
                FacilitatorType::Child if node.child_node_id().is_none() => {
                    diags.push(error(
                        self.name(),
                        Some(&node.uuid),
                        format!("Child node '{}' has no 'child' parameter", node.identifier),
                        Some("Add step_parameters.child naming the node to run"),
                    ));
                }
                FacilitatorType::Children => {
                    if let Err(e) = node.child_specs() {
                        diags.push(error(self.name(), Some(&node.uuid), e.to_string(), None));
                    }
                }
                _ => {}
            }
        }
        diags
    }
}

struct ChildTargetExistsRule;
impl LintRule for ChildTargetExistsRule {
    fn name(&self) -> &str {
        "child_target_exists"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let ids = plan.nodes_by_id();
        let mut diags = Vec::new();
        for node in &plan.nodes {
            for child in node.referenced_node_ids() {
                if !ids.contains_key(child.as_str()) {
                    diags.push(error(
                        self.name(),
                        Some(&node.uuid),
                        format!(
                            "Node '{}' references child '{}' which does not exist",
                            node.identifier, child
                        ),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

/// The plan must be a tree: no node may (transitively) instantiate itself.
struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str {
        "acyclic"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let edges: HashMap<&str, Vec<String>> = plan
            .nodes
            .iter()
            .map(|n| (n.uuid.as_str(), n.referenced_node_ids()))
            .collect();

        // Kahn's algorithm; whatever is left over sits on a cycle.
        let mut indegree: HashMap<&str, usize> = edges.keys().map(|k| (*k, 0)).collect();
        for children in edges.values() {
            for c in children {
                if let Some(d) = indegree.get_mut(c.as_str()) {
                    *d += 1;
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for c in edges.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(c.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(c.as_str());
                    }
                }
            }
        }
        if visited == indegree.len() {
            return vec![];
        }
        let mut on_cycle: Vec<&str> = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(k, _)| k)
            .collect();
        on_cycle.sort_unstable();
        vec![error(
            self.name(),
            None,
            format!("Child references form a cycle through: {}", on_cycle.join(", ")),
            Some("Plans are trees; a node may not instantiate one of its ancestors"),
        )]
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let ids = plan.nodes_by_id();
        if !ids.contains_key(plan.root_node_id.as_str()) {
            return vec![];
        }
        let mut reached: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([plan.root_node_id.clone()]);
        while let Some(id) = queue.pop_front() {
            if !reached.insert(id.clone()) {
                continue;
            }
            if let Some(node) = ids.get(id.as_str()) {
                queue.extend(node.referenced_node_ids());
            }
        }
        plan.nodes
            .iter()
            .filter(|n| !reached.contains(&n.uuid))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Node '{}' is not reachable from the root", n.identifier),
                node_id: Some(n.uuid.clone()),
                fix: None,
            })
            .collect()
    }
}

struct ExecutionInputTemplateRule;
impl LintRule for ExecutionInputTemplateRule {
    fn name(&self) -> &str {
        "execution_input_template"
    }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        plan.nodes
            .iter()
            .filter_map(|n| {
                let template = n.execution_input_template.as_deref()?;
                serde_yaml::from_str::<serde_yaml::Value>(template)
                    .err()
                    .map(|e| {
                        error(
                            self.name(),
                            Some(&n.uuid),
                            format!(
                                "Execution input template of '{}' is not valid YAML: {e}",
                                n.identifier
                            ),
                            None,
                        )
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all lint rules against the plan.
pub fn validate(plan: &Plan) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(RootNodeRule),
        Box::new(UniqueNodeIdsRule),
        Box::new(ChildParametersRule),
        Box::new(ChildTargetExistsRule),
        Box::new(AcyclicRule),
        Box::new(ReachabilityRule),
        Box::new(ExecutionInputTemplateRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(plan));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(plan: &Plan) -> arbor_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(plan);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(arbor_types::ArborError::InvalidRequest(format!(
            "Plan validation failed: {}",
            errors.join("; ")
        )));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(yaml: &str) -> Plan {
        Plan::from_yaml_str(yaml).unwrap()
    }

    const VALID: &str = r#"
uuid: p
root_node_id: root
nodes:
  - uuid: root
    identifier: pipeline
    step_type: { type: children, category: PIPELINE }
    facilitator: CHILDREN
    step_parameters: { children: [a, b] }
  - uuid: a
    identifier: a
    step_type: { type: sync, category: STEP }
    facilitator: SYNC
  - uuid: b
    identifier: b
    step_type: { type: child, category: STAGE }
    facilitator: CHILD
    step_parameters: { child: c }
  - uuid: c
    identifier: c
    step_type: { type: task, category: STEP }
    facilitator: TASK
"#;

    #[test]
    fn valid_plan_passes() {
        let diags = validate(&plan(VALID));
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        assert!(validate_or_raise(&plan(VALID)).is_ok());
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut p = plan(VALID);
        p.root_node_id = "nope".into();
        let diags = validate(&p);
        assert!(diags.iter().any(|d| d.rule == "root_node"));
        assert!(validate_or_raise(&p).is_err());
    }

    #[test]
    fn dangling_child_reference() {
        let mut p = plan(VALID);
        p.nodes[2].step_parameters = serde_json::json!({ "child": "ghost" });
        let diags = validate(&p);
        let d = diags
            .iter()
            .find(|d| d.rule == "child_target_exists")
            .unwrap();
        assert!(d.message.contains("ghost"));
        assert_eq!(d.node_id.as_deref(), Some("b"));
    }

    #[test]
    fn child_without_parameter() {
        let mut p = plan(VALID);
        p.nodes[2].step_parameters = serde_json::Value::Null;
        let diags = validate(&p);
        assert!(diags.iter().any(|d| d.rule == "child_parameters"));
    }

    #[test]
    fn cycle_is_detected() {
        let mut p = plan(VALID);
        p.nodes[3].facilitator = FacilitatorType::Child;
        p.nodes[3].step_parameters = serde_json::json!({ "child": "b" });
        let err = validate_or_raise(&p).unwrap_err();
        assert!(err.to_string().contains("cycle through: b, c"));
    }

    #[test]
    fn unreachable_node_is_a_warning() {
        let mut p = plan(VALID);
        p.nodes[0].step_parameters = serde_json::json!({ "children": ["a"] });
        let diags = validate_or_raise(&p).unwrap();
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn duplicate_ids() {
        let mut p = plan(VALID);
        let dup = p.nodes[1].clone();
        p.nodes.push(dup);
        assert!(validate(&p).iter().any(|d| d.rule == "unique_node_ids"));
    }

    #[test]
    fn bad_input_template() {
        let mut p = plan(VALID);
        p.nodes[1].execution_input_template = Some("a: [".into());
        assert!(validate(&p)
            .iter()
            .any(|d| d.rule == "execution_input_template"));
    }
}
