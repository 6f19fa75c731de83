//! Field-qualified names over YAML documents, runtime-input placeholders,
//! and the validation and merge of user input into an input template.
//!
//! A document is flattened into `path -> leaf` pairs: mapping keys join with
//! `.`, list items are addressed by their `identifier` (or `name`) when they
//! have one and by index otherwise.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use arbor_types::Result;

/// Placeholder marking a value the user supplies at runtime.
pub const INPUT_PLACEHOLDER: &str = "<+input>";

const NO_RUNTIME_INPUT: &str = "Pipeline no longer contains any runtime input";
const NOT_A_RUNTIME_INPUT: &str = "Field either not present in pipeline or not a runtime input";

pub type FqnMap = BTreeMap<String, Value>;

/// Parse YAML into JSON. Blank text is an empty document.
pub fn parse_yaml(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_yaml::from_str(text)?)
}

fn item_key(item: &Value, index: usize) -> String {
    ["identifier", "name"]
        .iter()
        .find_map(|k| item.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| index.to_string())
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

pub fn flatten(value: &Value) -> FqnMap {
    let mut out = FqnMap::new();
    let mut stack = vec![(String::new(), value)];
    while let Some((path, v)) = stack.pop() {
        match v {
            Value::Object(map) if !map.is_empty() => {
                for (k, child) in map {
                    stack.push((join(&path, k), child));
                }
            }
            Value::Array(items) if !items.is_empty() => {
                for (i, child) in items.iter().enumerate() {
                    stack.push((join(&path, &item_key(child, i)), child));
                }
            }
            Value::Null if path.is_empty() => {}
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
    out
}

/// `identifier`, `type` and `name` fields are structural: input may repeat
/// them but never change them.
fn is_identity_field(fqn: &str) -> bool {
    matches!(
        fqn.rsplit('.').next(),
        Some("identifier") | Some("type") | Some("name")
    )
}

// ---------------------------------------------------------------------------
// Runtime input placeholders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInput {
    pub allowed_values: Option<Vec<String>>,
    pub regex: Option<String>,
    pub default: Option<String>,
}

/// Parse `<+input>` with its optional `.allowedValues(..)`, `.regex(..)` and
/// `.default(..)` suffixes. `None` when the text is not a placeholder.
pub fn parse_runtime_input(text: &str) -> Option<RuntimeInput> {
    let mut rest = text.trim().strip_prefix(INPUT_PLACEHOLDER)?;
    let mut input = RuntimeInput::default();
    while let Some(after_dot) = rest.strip_prefix('.') {
        let Some(open) = after_dot.find('(') else {
            break;
        };
        let name = &after_dot[..open];
        let Some(close) = matching_paren(after_dot, open) else {
            break;
        };
        let args = &after_dot[open + 1..close];
        match name {
            "allowedValues" => {
                input.allowed_values = Some(args.split(',').map(|s| s.trim().to_string()).collect())
            }
            "regex" => input.regex = Some(args.to_string()),
            "default" => input.default = Some(args.trim().to_string()),
            _ => {}
        }
        rest = &after_dot[close + 1..];
    }
    Some(input)
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_expression(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.contains("<+"))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_static_value(fqn: &str, template: &Value, value: &Value) -> Option<String> {
    let Some(input) = template.as_str().and_then(parse_runtime_input) else {
        if template != value {
            return Some(format!(
                "The value for {fqn} is {} in the pipeline yaml, but the input has it as {}",
                scalar_text(template),
                scalar_text(value)
            ));
        }
        return None;
    };
    if is_expression(value) {
        return None;
    }
    let text = scalar_text(value);
    if let Some(allowed) = &input.allowed_values {
        if !allowed.contains(&text) {
            return Some(format!(
                "Value {text} is not one of the allowed values [{}]",
                allowed.join(", ")
            ));
        }
    }
    if let Some(pattern) = &input.regex {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) if re.is_match(&text) => {}
            Ok(_) => return Some(format!("Value {text} does not match regex {pattern}")),
            Err(e) => return Some(format!("Invalid regex {pattern}: {e}")),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Validation and merge
// ---------------------------------------------------------------------------

/// Every input field that the template does not accept, with the reason.
pub fn invalid_fqns(template_yaml: &str, input_yaml: &str) -> Result<BTreeMap<String, String>> {
    let mut input = flatten(&parse_yaml(input_yaml)?);
    let mut errors = BTreeMap::new();

    if template_yaml.trim().is_empty() {
        for fqn in input.into_keys() {
            errors.insert(fqn, NO_RUNTIME_INPUT.to_string());
        }
        return Ok(errors);
    }

    let template = flatten(&parse_yaml(template_yaml)?);
    for (fqn, template_value) in &template {
        match input.remove(fqn) {
            Some(value) => {
                let error = if is_identity_field(fqn) {
                    (scalar_text(&value) != scalar_text(template_value)).then(|| {
                        format!(
                            "The value for {fqn} is {} in the pipeline yaml, \
                             but the input has it as {}",
                            scalar_text(template_value),
                            scalar_text(&value)
                        )
                    })
                } else {
                    validate_static_value(fqn, template_value, &value)
                };
                if let Some(error) = error {
                    errors.insert(fqn.clone(), error);
                }
            }
            None => {
                // the user may supply a whole subtree for one template leaf
                let prefix = format!("{fqn}.");
                input.retain(|k, _| !k.starts_with(&prefix));
            }
        }
    }
    for fqn in input.into_keys() {
        errors.insert(fqn, NOT_A_RUNTIME_INPUT.to_string());
    }
    Ok(errors)
}

fn merge_values(template: &Value, input: &Value) -> Value {
    match (template, input) {
        (Value::Object(t), Value::Object(i)) => {
            let merged = t
                .iter()
                .map(|(k, tv)| {
                    let v = match i.get(k) {
                        Some(iv) => merge_values(tv, iv),
                        None => tv.clone(),
                    };
                    (k.clone(), v)
                })
                .collect();
            Value::Object(merged)
        }
        (Value::Array(t), Value::Array(i)) => {
            let by_key: BTreeMap<String, &Value> = i
                .iter()
                .enumerate()
                .map(|(idx, item)| (item_key(item, idx), item))
                .collect();
            Value::Array(
                t.iter()
                    .enumerate()
                    .map(|(idx, tv)| match by_key.get(&item_key(tv, idx)) {
                        Some(iv) => merge_values(tv, iv),
                        None => tv.clone(),
                    })
                    .collect(),
            )
        }
        (_, Value::Null) => template.clone(),
        (_, value) => value.clone(),
    }
}

/// Placeholders left unfilled take their `.default(..)` value.
fn apply_defaults(value: &mut Value) {
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::String(s) => {
                if let Some(default) = parse_runtime_input(s).and_then(|i| i.default) {
                    *v = serde_yaml::from_str::<Value>(&default)
                        .unwrap_or(Value::String(default));
                }
            }
            Value::Array(items) => stack.extend(items.iter_mut()),
            Value::Object(map) => stack.extend(map.values_mut()),
            _ => {}
        }
    }
}

/// Deep-merge user input into the template.
pub fn merge_input(template_yaml: &str, input_yaml: &str) -> Result<Value> {
    let template = parse_yaml(template_yaml)?;
    let input = parse_yaml(input_yaml)?;
    let mut merged = merge_values(&template, &input);
    apply_defaults(&mut merged);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
stage:
  identifier: deploy
  type: Deployment
  spec:
    env: <+input>.allowedValues(dev,staging,prod)
    replicas: <+input>.default(2)
    tag: <+input>.regex(v[0-9]+\.[0-9]+)
    region: us-east-1
    steps:
      - identifier: rollout
        timeout: <+input>
"#;

    #[test]
    fn flatten_addresses_list_items_by_identifier() {
        let map = flatten(&parse_yaml(TEMPLATE).unwrap());
        assert!(map.contains_key("stage.spec.steps.rollout.timeout"));
        assert!(map.contains_key("stage.spec.steps.rollout.identifier"));
        assert_eq!(map["stage.spec.region"], Value::String("us-east-1".into()));

        let list = flatten(&serde_json::json!({ "args": ["a", "b"] }));
        assert_eq!(list["args.1"], Value::String("b".into()));
    }

    #[test]
    fn runtime_input_suffixes_are_parsed() {
        let input = parse_runtime_input("<+input>.allowedValues(a, b).default(a)").unwrap();
        assert_eq!(input.allowed_values, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(input.default.as_deref(), Some("a"));

        let nested = parse_runtime_input("<+input>.regex(^(x|y)$)").unwrap();
        assert_eq!(nested.regex.as_deref(), Some("^(x|y)$"));

        assert_eq!(parse_runtime_input("<+input>"), Some(RuntimeInput::default()));
        assert!(parse_runtime_input("fixed").is_none());
    }

    #[test]
    fn valid_input_has_no_errors() {
        let input = r#"
stage:
  identifier: deploy
  spec:
    env: prod
    tag: v1.4
    steps:
      - identifier: rollout
        timeout: 10m
"#;
        assert!(invalid_fqns(TEMPLATE, input).unwrap().is_empty());
    }

    #[test]
    fn every_offending_field_is_reported() {
        let input = r#"
stage:
  identifier: other
  spec:
    env: qa
    tag: latest
    region: eu-west-1
    color: blue
"#;
        let errors = invalid_fqns(TEMPLATE, input).unwrap();
        let fields: Vec<_> = errors.keys().map(String::as_str).collect();
        assert_eq!(
            fields,
            vec![
                "stage.identifier",
                "stage.spec.color",
                "stage.spec.env",
                "stage.spec.region",
                "stage.spec.tag",
            ]
        );
        assert_eq!(errors["stage.spec.color"], NOT_A_RUNTIME_INPUT);
    }

    #[test]
    fn expressions_pass_static_validation() {
        let input = "stage:\n  spec:\n    env: <+pipeline.variables.env>\n";
        assert!(invalid_fqns(TEMPLATE, input).unwrap().is_empty());
    }

    #[test]
    fn empty_template_rejects_everything() {
        let errors = invalid_fqns("", "a: 1\nb: 2\n").unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.values().all(|e| e == NO_RUNTIME_INPUT));
    }

    #[test]
    fn subtree_for_a_template_leaf_is_accepted() {
        let template = "spec:\n  settings: <+input>\n";
        let input = "spec:\n  settings:\n    retries: 3\n";
        assert!(invalid_fqns(template, input).unwrap().is_empty());
    }

    #[test]
    fn merge_fills_placeholders_and_defaults() {
        let input = "stage:\n  spec:\n    env: prod\n    steps:\n      \
                     - identifier: rollout\n        timeout: 10m\n";
        let merged = merge_input(TEMPLATE, input).unwrap();
        assert_eq!(merged["stage"]["spec"]["env"], "prod");
        assert_eq!(merged["stage"]["spec"]["replicas"], 2);
        assert_eq!(merged["stage"]["spec"]["region"], "us-east-1");
        assert_eq!(merged["stage"]["spec"]["steps"][0]["timeout"], "10m");
        // no default: placeholder stays
        assert_eq!(
            merged["stage"]["spec"]["tag"],
            "<+input>.regex(v[0-9]+\\.[0-9]+)"
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let input = "stage:\n  spec:\n    env: dev\n";
        assert_eq!(
            merge_input(TEMPLATE, input).unwrap(),
            merge_input(TEMPLATE, input).unwrap()
        );
    }

    #[test]
    fn empty_input_is_the_template_with_defaults() {
        let merged = merge_input(TEMPLATE, "").unwrap();
        assert_eq!(merged["stage"]["spec"]["replicas"], 2);
        assert_eq!(
            merged["stage"]["spec"]["env"],
            "<+input>.allowedValues(dev,staging,prod)"
        );
    }
}
