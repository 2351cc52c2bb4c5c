//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Input/output wiring between workflow steps.
//!
//! A completed job's relevant outputs are extracted into a small map,
//! and the next task's declared inputs absorb them: a previous output
//! only lands where the consumer declared a slot for it (or where the
//! key is a well-known IO key).

use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::store::job::{JobDocument, JobType};
use crate::util::slug::slugify;

/// Keys that flow between steps without an explicit slot declaration.
const KNOWN_IO_KEYS: &[&str] = &[
    "model_name",
    "model_architecture",
    "adaptor_name",
    "dataset_name",
];

/// Extract the outputs of a finished job that downstream steps can
/// consume.
///
/// GENERATE jobs yield their dataset (top-level `dataset_id` preferred
/// over the config one, slugified); TRAIN jobs yield the model name and
/// the adaptor name when one was configured. Everything else yields
/// nothing.
pub fn extract_previous_job_outputs(job: &JobDocument) -> Map<String, Value> {
    let mut outputs = Map::new();

    match job.job_type {
        JobType::Generate => {
            let dataset_id = job
                .job_data_str("dataset_id")
                .filter(|d| !d.is_empty())
                .or_else(|| {
                    job.config()
                        .get("dataset_id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                });
            if let Some(dataset_id) = dataset_id {
                outputs.insert("dataset_name".to_string(), json!(slugify(&dataset_id)));
            }
        }
        JobType::Train => {
            let config = job.config();
            if let Some(model_name) = config.get("model_name").and_then(Value::as_str) {
                outputs.insert("model_name".to_string(), json!(model_name));
            }
            if let Some(adaptor) = config
                .get("adaptor_name")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
            {
                outputs.insert("adaptor_name".to_string(), json!(adaptor));
            }
        }
        _ => {}
    }

    outputs
}

fn parse_io(raw: Option<&str>) -> Map<String, Value> {
    raw.filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

/// Merge a previous step's outputs into a task's declared IO.
///
/// Keys overwrite existing input slots or known IO keys; keys the
/// consumer never declared and that are not well-known do not appear.
/// TRAIN tasks always declare `adaptor_name` in their outputs.
///
/// Returns `(inputs, outputs)` re-encoded as JSON strings.
pub fn prepare_next_task_io(
    task_type: &str,
    declared_inputs: Option<&str>,
    declared_outputs: Option<&str>,
    previous_outputs: &Map<String, Value>,
) -> (String, String) {
    let mut inputs = parse_io(declared_inputs);
    let mut outputs = parse_io(declared_outputs);

    for (key, value) in previous_outputs {
        if inputs.contains_key(key) || KNOWN_IO_KEYS.contains(&key.as_str()) {
            inputs.insert(key.clone(), value.clone());
        }
    }

    if task_type == "TRAIN" && !outputs.contains_key("adaptor_name") {
        outputs.insert("adaptor_name".to_string(), json!(""));
    }

    (
        serde_json::to_string(&Value::Object(inputs)).unwrap_or_else(|_| "{}".to_string()),
        serde_json::to_string(&Value::Object(outputs)).unwrap_or_else(|_| "{}".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(value: Value) -> JobDocument {
        JobDocument::from_value(&value, "1")
    }

    #[test]
    fn generate_prefers_top_level_dataset_id() {
        let doc = job(json!({
            "type": "GENERATE",
            "job_data": {
                "dataset_id": "Top Level Dataset",
                "config": { "dataset_id": "Config Level Dataset" },
            },
        }));
        let outputs = extract_previous_job_outputs(&doc);
        assert_eq!(outputs["dataset_name"], json!("top-level-dataset"));
    }

    #[test]
    fn generate_falls_back_to_config_dataset_id() {
        let doc = job(json!({
            "type": "GENERATE",
            "job_data": { "config": { "dataset_id": "cfg-ds" } },
        }));
        let outputs = extract_previous_job_outputs(&doc);
        assert_eq!(outputs["dataset_name"], json!("cfg-ds"));
    }

    #[test]
    fn train_emits_model_and_optional_adaptor() {
        let doc = job(json!({
            "type": "TRAIN",
            "job_data": { "config": { "model_name": "test-model" } },
        }));
        let outputs = extract_previous_job_outputs(&doc);
        assert_eq!(outputs["model_name"], json!("test-model"));
        assert!(!outputs.contains_key("adaptor_name"));

        let doc = job(json!({
            "type": "TRAIN",
            "job_data": {
                "config": { "model_name": "m", "adaptor_name": "test-adaptor" },
            },
        }));
        let outputs = extract_previous_job_outputs(&doc);
        assert_eq!(outputs["adaptor_name"], json!("test-adaptor"));
    }

    #[test]
    fn other_job_types_emit_nothing() {
        let doc = job(json!({ "type": "EVAL", "job_data": { "config": {} } }));
        assert!(extract_previous_job_outputs(&doc).is_empty());
    }

    #[test]
    fn io_merge_overrides_declared_slots_and_known_keys() {
        let mut previous = Map::new();
        previous.insert("model_name".to_string(), json!("new_model"));
        previous.insert("dataset_name".to_string(), json!("test_dataset"));

        let (inputs_json, outputs_json) = prepare_next_task_io(
            "TRAIN",
            Some(r#"{"existing_input": "value", "model_name": "old_model"}"#),
            Some(r#"{"existing_output": "result"}"#),
            &previous,
        );
        let inputs: Value = serde_json::from_str(&inputs_json).unwrap();
        let outputs: Value = serde_json::from_str(&outputs_json).unwrap();

        assert_eq!(inputs["model_name"], json!("new_model"));
        assert_eq!(inputs["dataset_name"], json!("test_dataset"));
        assert_eq!(inputs["existing_input"], json!("value"));
        assert_eq!(outputs["existing_output"], json!("result"));
        assert!(outputs.get("adaptor_name").is_some());
    }

    #[test]
    fn partial_previous_outputs_propagate_only_declared_or_known() {
        let mut previous = Map::new();
        previous.insert("model_name".to_string(), json!("test_model"));
        previous.insert("private_key".to_string(), json!("nope"));

        let (inputs_json, _) = prepare_next_task_io("EVAL", Some("{}"), Some("{}"), &previous);
        let inputs: Value = serde_json::from_str(&inputs_json).unwrap();

        assert_eq!(inputs["model_name"], json!("test_model"));
        assert!(inputs.get("private_key").is_none());
        assert!(inputs.get("model_architecture").is_none());
        assert!(inputs.get("adaptor_name").is_none());
    }

    #[test]
    fn empty_previous_outputs_leave_io_unchanged() {
        let previous = Map::new();
        let (inputs_json, outputs_json) = prepare_next_task_io(
            "EVAL",
            Some(r#"{"model_name": "m"}"#),
            Some(r#"{"score": ""}"#),
            &previous,
        );
        assert_eq!(
            serde_json::from_str::<Value>(&inputs_json).unwrap(),
            json!({"model_name": "m"})
        );
        assert_eq!(
            serde_json::from_str::<Value>(&outputs_json).unwrap(),
            json!({"score": ""})
        );
    }

    #[test]
    fn blank_io_reads_as_empty_objects() {
        let previous = Map::new();
        let (inputs_json, outputs_json) = prepare_next_task_io("EVAL", None, Some("  "), &previous);
        assert_eq!(inputs_json, "{}");
        assert_eq!(outputs_json, "{}");
    }
}
