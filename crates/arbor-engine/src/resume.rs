//! Carrying state from an earlier attempt or execution into a new one.

use std::collections::HashSet;

use arbor_types::{now_millis, ContextElement, ContextElementKind, Result, SweepingOutput};

use crate::store::{ExecutionStore, OutputStore};

/// Context a resumed node starts with.
///
/// Artifact elements from `previous` are carried forward unless `current`
/// already has one of the same kind and name. With `merge_variables`,
/// standard variables are merged too; keys already present in `current`
/// win over the previous attempt's.
pub fn prepare_resume_response(
    previous: &[ContextElement],
    current: &[ContextElement],
    merge_variables: bool,
) -> Vec<ContextElement> {
    let mut out: Vec<ContextElement> = current.to_vec();

    for element in previous.iter().filter(|e| e.kind.is_artifact()) {
        let present = out
            .iter()
            .any(|c| c.kind == element.kind && c.name == element.name);
        if !present {
            out.push(element.clone());
        }
    }

    if merge_variables {
        for element in previous
            .iter()
            .filter(|e| e.kind == ContextElementKind::Standard)
        {
            match out
                .iter_mut()
                .find(|c| c.kind == ContextElementKind::Standard && c.name == element.name)
            {
                Some(existing) => merge_missing_keys(&mut existing.value, &element.value),
                None => out.push(element.clone()),
            }
        }
    }
    out
}

fn merge_missing_keys(target: &mut serde_json::Value, source: &serde_json::Value) {
    let (Some(target), Some(source)) = (target.as_object_mut(), source.as_object()) else {
        return;
    };
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Copy sweeping outputs from one plan execution into another, optionally
/// only those produced by `producer_ids`. Returns how many were copied.
pub async fn copy_pipeline_stage_outputs(
    store: &dyn ExecutionStore,
    from_plan_execution_id: &str,
    to_plan_execution_id: &str,
    producer_ids: Option<&[String]>,
) -> Result<usize> {
    if from_plan_execution_id == to_plan_execution_id {
        return Ok(0);
    }

    let outputs = store
        .fetch_outputs(from_plan_execution_id, producer_ids)
        .await?;
    let mut seen = HashSet::new();
    let mut copied = 0;
    for output in outputs {
        if !seen.insert(output.uuid.clone()) {
            continue;
        }
        store
            .save_output(SweepingOutput {
                uuid: uuid::Uuid::new_v4().to_string(),
                plan_execution_id: to_plan_execution_id.to_string(),
                created_at: now_millis(),
                ..output
            })
            .await?;
        copied += 1;
    }
    tracing::debug!(
        from = %from_plan_execution_id,
        to = %to_plan_execution_id,
        copied,
        "Copied stage outputs"
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn element(kind: ContextElementKind, name: &str, value: serde_json::Value) -> ContextElement {
        ContextElement {
            kind,
            name: name.into(),
            value,
        }
    }

    #[test]
    fn only_artifacts_carry_over_by_default() {
        let previous = vec![
            element(ContextElementKind::Artifact, "image", json!("app:1")),
            element(ContextElementKind::ArtifactVariable, "digest", json!("sha256:ab")),
            element(ContextElementKind::Standard, "vars", json!({ "a": 1 })),
            element(ContextElementKind::Environment, "env", json!("prod")),
        ];
        let out = prepare_resume_response(&previous, &[], false);
        let names: Vec<_> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["image", "digest"]);
    }

    #[test]
    fn current_artifacts_are_not_duplicated() {
        let previous = vec![element(ContextElementKind::Artifact, "image", json!("app:1"))];
        let current = vec![element(ContextElementKind::Artifact, "image", json!("app:2"))];
        let out = prepare_resume_response(&previous, &current, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!("app:2"));
    }

    #[test]
    fn variable_merge_keeps_first_write() {
        let previous = vec![
            element(ContextElementKind::Standard, "vars", json!({ "a": 1, "b": 2 })),
            element(ContextElementKind::Standard, "extra", json!({ "z": true })),
        ];
        let current = vec![element(ContextElementKind::Standard, "vars", json!({ "a": 10 }))];
        let out = prepare_resume_response(&previous, &current, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, json!({ "a": 10, "b": 2 }));
        assert_eq!(out[1].name, "extra");
    }

    fn output(uuid: &str, pe: &str, producer: &str) -> SweepingOutput {
        SweepingOutput {
            uuid: uuid.into(),
            plan_execution_id: pe.into(),
            producer_id: producer.into(),
            name: producer.into(),
            group: Some("STAGE".into()),
            value: json!({ "ok": true }),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn copies_outputs_into_the_new_execution() {
        let store = InMemoryStore::new();
        store.save_output(output("o1", "old", "build")).await.unwrap();
        store.save_output(output("o2", "old", "test")).await.unwrap();
        store.save_output(output("o3", "other", "build")).await.unwrap();

        let copied = copy_pipeline_stage_outputs(&store, "old", "new", None)
            .await
            .unwrap();
        assert_eq!(copied, 2);
        let outputs = store.fetch_outputs("new", None).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.plan_execution_id == "new"));
        assert!(outputs.iter().all(|o| o.uuid != "o1" && o.uuid != "o2"));

        let producers = ["build".to_string()];
        let only_build = copy_pipeline_stage_outputs(&store, "old", "newer", Some(&producers))
            .await
            .unwrap();
        assert_eq!(only_build, 1);
    }

    #[tokio::test]
    async fn same_execution_copies_nothing() {
        let store = InMemoryStore::new();
        store.save_output(output("o1", "pe", "build")).await.unwrap();
        assert_eq!(
            copy_pipeline_stage_outputs(&store, "pe", "pe", None).await.unwrap(),
            0
        );
        assert_eq!(store.fetch_outputs("pe", None).await.unwrap().len(), 1);
    }
}
