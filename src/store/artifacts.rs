//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Saving job outputs into the workspace.
//!
//! Files and directories land in the job's artifacts or eval-results
//! directory; models are additionally registered in the workspace model
//! zoo with metadata and a provenance companion. Every save is tracked
//! in the matching `job_data` list so listings stay cheap.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::storage::{self, Storage, Workspace};
use crate::store::dataset::Dataset;
use crate::store::job::Job;
use crate::store::model::{Model, Provenance};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Artifact,
    EvalResult,
    Model,
}

fn is_remote(path: &str) -> bool {
    path.contains("://")
}

/// Copy a file or tree from an arbitrary source (local path or storage
/// URI) into the workspace storage.
async fn copy_into_workspace(ws: &Workspace, source: &str, dest: &str) -> Result<bool> {
    let src_storage = if is_remote(source) {
        ws.storage().clone()
    } else {
        Storage::for_root(source)?
    };

    if !src_storage.exists(source).await? {
        return Err(anyhow!("Artifact source does not exist: {}", source));
    }

    let src_is_dir = src_storage.isdir(source).await?;
    if src_is_dir {
        // Directories overwrite whole
        if ws.storage().exists(dest).await? {
            ws.storage().rm_tree(dest).await?;
        }
        let src_root = source.trim_end_matches('/');
        for file in src_storage.find(src_root).await? {
            let rel = file
                .strip_prefix(src_root)
                .ok_or_else(|| anyhow!("File {} escapes source {}", file, src_root))?
                .trim_start_matches('/');
            let data = src_storage.read(&file).await?;
            ws.storage()
                .write(&storage::join(dest, &[rel]), &data)
                .await?;
        }
    } else {
        let data = src_storage.read(source).await?;
        ws.storage().write(dest, &data).await?;
    }

    Ok(src_is_dir)
}

async fn track_in_job_data(job: &Job, key: &str, dest: &str) -> Result<()> {
    let mut list = job
        .job_data()
        .await?
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    list.push(json!(dest));
    job.update_job_data_field(key, Value::Array(list)).await
}

/// Save a file or directory produced by a job.
///
/// Returns the destination path. Repeating a save with the same source
/// and name lands on the same destination: directories are replaced,
/// files overwritten in place.
pub async fn save_artifact(
    ws: &Workspace,
    job: &Job,
    source: &str,
    name: Option<&str>,
    kind: ArtifactKind,
    config: Option<&Map<String, Value>>,
) -> Result<String> {
    if source.trim().is_empty() {
        return Err(anyhow!("source path must be a non-empty string"));
    }

    if kind == ArtifactKind::Model {
        return save_model_artifact(ws, job, source, name, config).await;
    }

    let dest_dir = match kind {
        ArtifactKind::EvalResult => job.eval_results_dir().await?,
        _ => job.artifacts_dir().await?,
    };
    let base_name = name
        .filter(|n| !n.trim().is_empty())
        .map(|n| n.to_string())
        .unwrap_or_else(|| storage::file_name(source).to_string());
    let dest = storage::join(&dest_dir, &[&base_name]);

    copy_into_workspace(ws, source, &dest)
        .await
        .with_context(|| anyhow!("Saving artifact {} for job {}", source, job.id()))?;

    let key = match kind {
        ArtifactKind::EvalResult => "eval_results",
        _ => "artifacts",
    };
    track_in_job_data(job, key, &dest).await?;
    job.log_info(&format!("Artifact saved to '{}'", dest)).await;

    Ok(dest)
}

/// Save a model into the workspace models directory and register it so
/// it shows up in listings. The name is prefixed with the job id for
/// uniqueness.
async fn save_model_artifact(
    ws: &Workspace,
    job: &Job,
    source: &str,
    name: Option<&str>,
    config: Option<&Map<String, Value>>,
) -> Result<String> {
    let base_name = format!(
        "{}_{}",
        job.id(),
        name.filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| storage::file_name(source).to_string())
    );
    let dest = storage::join(&ws.models_dir(), &[&base_name]);

    let src_is_dir = copy_into_workspace(ws, source, &dest)
        .await
        .with_context(|| anyhow!("Saving model {} for job {}", source, job.id()))?;

    // Model config may be nested under "model" or flat
    let model_config = config
        .and_then(|c| c.get("model"))
        .and_then(Value::as_object)
        .cloned()
        .or_else(|| config.cloned())
        .unwrap_or_default();
    let architecture = model_config
        .get("architecture")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let model = Model::create_or_get(ws, &base_name).await?;
    let mut extra: Map<String, Value> = Default::default();
    extra.insert("job_id".to_string(), json!(job.id()));
    extra.insert(
        "description".to_string(),
        json!(format!("Model generated by job {}", job.id())),
    );
    if let Some(tag) = model_config.get("pipeline_tag").and_then(Value::as_str) {
        extra.insert("pipeline_tag".to_string(), json!(tag));
    }
    if let Some(parent) = model_config.get("parent_model").and_then(Value::as_str) {
        extra.insert("parent_model".to_string(), json!(parent));
    }

    let model_filename = if src_is_dir {
        String::new()
    } else {
        storage::file_name(&dest).to_string()
    };
    model
        .write_metadata(&architecture, &model_filename, extra)
        .await?;

    // Provenance inputs the dispatcher does not know stay empty for the
    // plugin to fill
    let provenance = Provenance {
        model_name: base_name.clone(),
        architecture,
        job_id: job.id().to_string(),
        start_time: chrono::Utc::now().to_rfc3339(),
        end_time: chrono::Utc::now().to_rfc3339(),
        ..Default::default()
    };
    model.write_provenance(&provenance).await?;

    track_in_job_data(job, "models", &dest).await?;
    job.log_info(&format!("Model saved as '{}'", base_name)).await;

    Ok(dest)
}

/// Save a dataset produced by a job: files land below the workspace
/// datasets directory, the dataset is registered as generated, and the
/// id is tracked in `job_data.generated_datasets`.
pub async fn save_generated_dataset(
    ws: &Workspace,
    job: &Job,
    source: &str,
    dataset_id: &str,
) -> Result<String> {
    let dataset_dir = storage::join(
        &ws.datasets_dir(),
        &[&crate::util::slug::safe_filename(dataset_id)],
    );

    let src_storage = if is_remote(source) {
        ws.storage().clone()
    } else {
        Storage::for_root(source)?
    };
    if !src_storage.exists(source).await? {
        return Err(anyhow!("Dataset source does not exist: {}", source));
    }

    // Data files live next to the dataset's index.json
    if src_storage.isdir(source).await? {
        let src_root = source.trim_end_matches('/');
        for file in src_storage.find(src_root).await? {
            let rel = file
                .strip_prefix(src_root)
                .ok_or_else(|| anyhow!("File {} escapes source {}", file, src_root))?
                .trim_start_matches('/');
            let data = src_storage.read(&file).await?;
            ws.storage()
                .write(&storage::join(&dataset_dir, &[rel]), &data)
                .await?;
        }
    } else {
        let data = src_storage.read(source).await?;
        ws.storage()
            .write(
                &storage::join(&dataset_dir, &[storage::file_name(source)]),
                &data,
            )
            .await?;
    }

    Dataset::register_generated(ws, dataset_id, &dataset_dir, None)
        .await
        .with_context(|| anyhow!("Registering dataset {} for job {}", dataset_id, job.id()))?;

    track_in_job_data(job, "generated_datasets", dataset_id).await?;
    job.log_info(&format!(
        "Dataset saved to '{}' and registered as generated dataset '{}'",
        dataset_dir, dataset_id
    ))
    .await;

    Ok(dataset_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrgContext;

    fn test_workspace(tmp: &tempfile::TempDir) -> Workspace {
        let mut cfg = config::Config::default();
        cfg.set("compatibility", "*").unwrap();
        cfg.set("home_dir", tmp.path().to_str().unwrap()).unwrap();
        let config = cfg
            .try_into::<crate::config::NotValidatedConfiguration>()
            .unwrap()
            .validate()
            .unwrap();
        Workspace::resolve(&config, OrgContext::anonymous()).unwrap()
    }

    #[tokio::test]
    async fn file_artifact_lands_in_artifacts_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let job = Job::create(&ws, "1").await.unwrap();

        let src = tmp.path().join("report.csv");
        std::fs::write(&src, "a,b\n1,2\n").unwrap();

        let dest = save_artifact(
            &ws,
            &job,
            src.to_str().unwrap(),
            None,
            ArtifactKind::Artifact,
            None,
        )
        .await
        .unwrap();

        assert!(dest.ends_with("/artifacts/report.csv"));
        assert_eq!(job.artifact_paths().await.unwrap(), vec![dest.clone()]);

        // repeated saves keep the destination stable
        let dest2 = save_artifact(
            &ws,
            &job,
            src.to_str().unwrap(),
            None,
            ArtifactKind::Artifact,
            None,
        )
        .await
        .unwrap();
        assert_eq!(dest, dest2);
    }

    #[tokio::test]
    async fn model_artifact_registers_metadata_and_provenance() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let job = Job::create(&ws, "7").await.unwrap();

        let src = tmp.path().join("weights.bin");
        std::fs::write(&src, b"\x00\x01").unwrap();

        let mut config: Map<String, Value> = Default::default();
        config.insert("architecture".to_string(), json!("LlamaForCausalLM"));

        let dest = save_artifact(
            &ws,
            &job,
            src.to_str().unwrap(),
            Some("tuned"),
            ArtifactKind::Model,
            Some(&config),
        )
        .await
        .unwrap();
        assert!(dest.ends_with("/models/7_tuned"));

        let model = Model::get(&ws, "7_tuned").await.unwrap();
        let provenance = model.provenance().await.unwrap().unwrap();
        assert_eq!(provenance.job_id, "7");
        assert_eq!(provenance.architecture, "LlamaForCausalLM");
        assert!(provenance.input_model.is_empty());

        let job_data = job.job_data().await.unwrap();
        let models = job_data.get("models").and_then(Value::as_array).unwrap();
        assert_eq!(models.len(), 1);
    }

    #[tokio::test]
    async fn generated_datasets_register_and_track() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let job = Job::create(&ws, "3").await.unwrap();

        let src_dir = tmp.path().join("generated");
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::write(src_dir.join("train.jsonl"), "{}\n").unwrap();

        let dest = save_generated_dataset(&ws, &job, src_dir.to_str().unwrap(), "synthetic-1")
            .await
            .unwrap();
        assert!(dest.ends_with("/datasets/synthetic-1"));
        assert!(ws
            .storage()
            .isfile(&storage::join(&dest, &["train.jsonl"]))
            .await
            .unwrap());

        let dataset = Dataset::get(&ws, "synthetic-1").await.unwrap();
        let data = dataset.resource().json_data().await.unwrap();
        assert_eq!(
            data.get("generated").and_then(Value::as_bool),
            Some(true)
        );

        let job_data = job.job_data().await.unwrap();
        let generated = job_data
            .get("generated_datasets")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(generated[0], json!("synthetic-1"));
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let job = Job::create(&ws, "2").await.unwrap();

        let result = save_artifact(
            &ws,
            &job,
            "/nonexistent/file",
            None,
            ArtifactKind::Artifact,
            None,
        )
        .await;
        assert!(result.is_err());
    }
}
