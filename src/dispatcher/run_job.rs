//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Per-job-type launch synthesis.
//!
//! `run_job` turns a queued job document into a concrete plugin
//! invocation: it materializes the plugin environment description,
//! writes the input file, synthesizes the `python main.py` flag list
//! for the job's type and hands the result to the local provider. It
//! never waits for the plugin: status is driven by polling.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use base64::Engine;
use log::debug;
use log::info;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::config::Configuration;
use crate::dispatcher::env::build_plugin_job_env_vars;
use crate::dispatcher::plugin;
use crate::dispatcher::sweep;
use crate::provider::local::LocalProvider;
use crate::provider::models::{ClusterConfig, LaunchOverrides};
use crate::provider::router::ProviderRouter;
use crate::provider::ComputeProvider;
use crate::storage::{self, Workspace};
use crate::store::experiment::Experiment;
use crate::store::job::{Job, JobDocument, JobStatus, JobType};
use crate::util::slug::safe_filename;

pub struct DispatchContext<'a> {
    pub config: &'a Configuration,
    pub ws: Workspace,
    pub router: &'a ProviderRouter,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Running { job_id: String, message: String },
    Complete { job_id: String },
    Failed { job_id: String, message: String },
}

/// Render a flag value: lists are JSON-encoded, scalars go bare.
fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn push_config_flags(args: &mut Vec<String>, config: &Map<String, Value>) {
    for (key, value) in config {
        args.push(format!("--{}", key));
        args.push(flag_value(value));
    }
}

/// Clone the experiment document with any nested JSON-encoded fields of
/// its config (e.g. `inferenceParams`, `evaluations`) decoded into
/// objects, so plugins receive structured data.
fn decoded_experiment(exp_doc: &Value) -> Value {
    let mut doc = exp_doc.clone();
    let config = match doc.get_mut("config") {
        Some(c) => c,
        None => return doc,
    };

    if let Value::String(encoded) = config {
        *config = serde_json::from_str(encoded).unwrap_or_else(|_| json!({}));
    }
    if let Some(obj) = config.as_object_mut() {
        for key in ["inferenceParams", "evaluations"] {
            if let Some(Value::String(encoded)) = obj.get(key) {
                if let Ok(decoded) = serde_json::from_str::<Value>(encoded) {
                    obj.insert(key.to_string(), decoded);
                }
            }
        }
    }
    doc
}

pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            matches!(s.to_lowercase().as_str(), "true" | "yes" | "on" | "1")
        }
        Some(Value::Number(n)) => n.as_i64() != Some(0),
        _ => false,
    }
}

pub(crate) async fn write_input_file(
    ws: &Workspace,
    file_name: &str,
    experiment: &Value,
    config: &Value,
) -> Result<String> {
    let temp_dir = ws.temp_dir();
    ws.storage().makedirs(&temp_dir).await?;
    let input_file = storage::join(&temp_dir, &[file_name]);
    let content = json!({ "experiment": experiment, "config": config });
    ws.storage()
        .write(&input_file, serde_json::to_string_pretty(&content)?.as_bytes())
        .await
        .with_context(|| anyhow!("Writing plugin input file {}", input_file))?;
    Ok(input_file)
}

/// Launch a command via the local provider in a fresh run directory.
/// Blocking work (venv sync, setup) runs on the blocking pool.
pub(crate) async fn launch_local(
    job_id: &str,
    command: String,
    setup: Option<String>,
    env_vars: BTreeMap<String, String>,
    job_dir: PathBuf,
) -> Result<u32> {
    std::fs::create_dir_all(&job_dir)
        .with_context(|| anyhow!("Creating run directory {}", job_dir.display()))?;

    let cluster_name = job_id.to_string();
    let config = ClusterConfig::builder()
        .cluster_name(Some(cluster_name.clone()))
        .provider_name(Some("local".to_string()))
        .command(Some(command))
        .setup(setup)
        .env_vars(env_vars)
        .provider_config(
            LaunchOverrides::builder()
                .workspace_dir(Some(job_dir))
                .build(),
        )
        .build();

    let outcome = tokio::task::spawn_blocking(move || {
        LocalProvider::new().launch_cluster(&cluster_name, &config)
    })
    .await
    .context("Joining launch task")?
    .map_err(|e| anyhow!("{}", e))?;

    outcome
        .pid
        .ok_or_else(|| anyhow!("Local launch returned no pid"))
}

async fn fail_job(job: &Job, message: &str) -> Result<RunOutcome> {
    job.set_error_message(message).await?;
    job.update_status(JobStatus::Failed).await?;
    Ok(RunOutcome::Failed {
        job_id: job.id().to_string(),
        message: message.to_string(),
    })
}

/// Dispatch one job by type. Exceptions before the launch mark the job
/// FAILED; after a successful launch the job is RUNNING and its further
/// fate belongs to the status poller.
pub async fn run_job(ctx: &DispatchContext<'_>, doc: &JobDocument) -> Result<RunOutcome> {
    info!("Running job: {}", doc.id);
    let job = Job::get(&ctx.ws, &doc.id).await?;

    // TASK jobs carry no execution; they settle immediately
    if doc.job_type == JobType::Task {
        job.update_status(JobStatus::Complete).await?;
        return Ok(RunOutcome::Complete {
            job_id: doc.id.clone(),
        });
    }

    let experiment_name = if doc.experiment_id.is_empty() {
        "default".to_string()
    } else {
        doc.experiment_id.clone()
    };
    let exp = Experiment::create_or_get(&ctx.ws, &experiment_name).await?;
    let experiment_details = decoded_experiment(&exp.document().await?);

    // Plugin name: top level for EVAL/GENERATE/DIFFUSION, nested in the
    // template config for everything else
    let plugin_name = match doc.job_type {
        JobType::Eval | JobType::Generate | JobType::Diffusion => doc
            .job_data_str("plugin")
            .filter(|p| !p.is_empty()),
        _ => doc
            .config()
            .get("plugin_name")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    };
    let plugin_name = match plugin_name {
        Some(name) => name,
        None => return fail_job(&job, &format!("{} job failed: No plugin configured", doc.job_type)).await,
    };

    let plugin_dir = match plugin::find_plugin_dir(&ctx.ws.plugins_dir(), &plugin_name) {
        Some(dir) => dir,
        None => {
            return fail_job(&job, &format!("{} job failed: No plugin found", doc.job_type)).await
        }
    };

    // A job bound to a remote provider is only dispatched when that
    // provider answers its liveness probe
    if let Some(provider_name) = doc.job_data_str("provider_name") {
        if provider_name != "local" && !ctx.router.check(&ctx.ws, &provider_name).await {
            return fail_job(
                &job,
                &format!(
                    "Provider '{}' is unreachable; job was not dispatched",
                    provider_name
                ),
            )
            .await;
        }
    }

    job.update_status(JobStatus::Launching).await?;

    let env_vars = build_plugin_job_env_vars(ctx.config, &ctx.ws, &doc.id, &experiment_name)?;
    let job_dir = ctx.ws.local_job_dir(&doc.id);
    let setup = plugin::resolve_setup_command(&plugin_dir)?;

    let launch = match doc.job_type {
        JobType::Eval | JobType::Generate => {
            let label = if doc.job_type == JobType::Eval {
                ("evaluator", "--eval_name")
            } else {
                ("generator", "--generation_name")
            };
            let task_name = doc.job_data_str(label.0).unwrap_or_default();
            let task_config = doc.config();
            let script_parameters = task_config
                .get("script_parameters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let exp_config = experiment_details
                .get("config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let pick = |task_key: &str, exp_key: &str| -> String {
                task_config
                    .get(task_key)
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .or_else(|| {
                        exp_config
                            .get(exp_key)
                            .and_then(Value::as_str)
                            .map(|s| s.to_string())
                    })
                    .unwrap_or_default()
            };
            let model_name = pick("model_name", "foundation");
            let model_path = exp_config
                .get("foundation_filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let model_architecture = pick("model_architecture", "foundation_model_architecture");
            let model_adapter = pick("model_adapter", "model_adapter");

            let input_file = write_input_file(
                &ctx.ws,
                &format!("plugin_input_{}.json", safe_filename(&plugin_name)),
                &experiment_details,
                &Value::Object(script_parameters.clone()),
            )
            .await?;

            let mut args = Vec::new();
            push_config_flags(&mut args, &script_parameters);
            args.extend([
                "--experiment_name".to_string(),
                experiment_name.clone(),
                label.1.to_string(),
                task_name,
                "--input_file".to_string(),
                input_file,
                "--model_name".to_string(),
                model_name,
                "--model_path".to_string(),
                model_path,
                "--model_architecture".to_string(),
                model_architecture,
                "--model_adapter".to_string(),
                model_adapter,
                "--job_id".to_string(),
                doc.id.clone(),
            ]);

            let command = plugin::build_main_command(&plugin_dir, &args);
            launch_local(&doc.id, command, setup, env_vars, job_dir).await
        }

        JobType::Export => {
            let template_config = doc.config();
            let params = template_config
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let plugin_architecture = {
                let lower = plugin_name.to_lowercase();
                if lower.contains("gguf") {
                    "GGUF"
                } else if lower.contains("mlx") {
                    "MLX"
                } else if lower.contains("llamafile") {
                    "LLAMAFILE"
                } else {
                    "OTHER"
                }
            };

            let exp_config = experiment_details
                .get("config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let input_model_id = exp_config
                .get("foundation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input_model_without_author = input_model_id
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let input_model_architecture = exp_config
                .get("foundation_model_architecture")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input_model_path = exp_config
                .get("foundation_filename")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .unwrap_or(&input_model_id)
                .to_string();

            let conversion_time = chrono::Utc::now().timestamp();
            let q_type = params
                .get("outtype")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    params
                        .get("q_bits")
                        .map(|b| format!("{}bit", flag_value(b)))
                });

            let output_model_id = match (plugin_architecture, &q_type) {
                ("GGUF", Some(q)) => {
                    format!("{}-{}-{}.gguf", input_model_without_author, conversion_time, q)
                }
                ("GGUF", None) => format!("{}-{}.gguf", input_model_without_author, conversion_time),
                (arch, Some(q)) => {
                    format!("{}-{}-{}-{}", arch, input_model_without_author, conversion_time, q)
                }
                (arch, None) => format!("{}-{}-{}", arch, input_model_without_author, conversion_time),
            };
            let output_model_id = safe_filename(&output_model_id);
            let output_dir = storage::join(&ctx.ws.models_dir(), &[&output_model_id]);
            ctx.ws.storage().makedirs(&output_dir).await?;

            let mut args = vec![
                "--job_id".to_string(),
                doc.id.clone(),
                "--model_name".to_string(),
                input_model_id,
                "--model_path".to_string(),
                input_model_path,
                "--model_architecture".to_string(),
                input_model_architecture,
                "--output_dir".to_string(),
                output_dir,
                "--output_model_id".to_string(),
                output_model_id,
            ];
            push_config_flags(&mut args, &params);

            let command = plugin::build_main_command(&plugin_dir, &args);
            launch_local(&doc.id, command, setup, env_vars, job_dir).await
        }

        JobType::Diffusion => {
            let mut task_config = doc.config();

            // Base64 image payloads become files in the job directory;
            // the oversized fields are dropped from the stored document
            let image_fields = [
                ("input_image", "input_image_path"),
                ("mask_image", "mask_image_path"),
            ];
            let mut removed = Vec::new();
            for (b64_key, path_key) in image_fields {
                let encoded = match task_config.get(b64_key).and_then(Value::as_str) {
                    Some(e) if !e.is_empty() => e.to_string(),
                    _ => continue,
                };
                match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                    Ok(decoded) => {
                        let file_path =
                            storage::join(job.dir(), &[&format!("{}.png", path_key)]);
                        ctx.ws.storage().write(&file_path, &decoded).await?;
                        task_config.insert(path_key.to_string(), json!(file_path));
                        task_config.remove(b64_key);
                        removed.push(b64_key);
                    }
                    Err(e) => {
                        debug!("Failed to decode {} for job {}: {}", b64_key, doc.id, e);
                    }
                }
            }
            if !removed.is_empty() {
                strip_base64_from_stored_config(&job, &removed).await?;
            }

            let mut args = Vec::new();
            for (key, value) in &task_config {
                if key != "plugin" {
                    args.push(format!("--{}", key));
                    args.push(flag_value(value));
                }
            }
            args.extend([
                "--job_id".to_string(),
                doc.id.clone(),
                "--experiment_name".to_string(),
                experiment_name.clone(),
                "--run_name".to_string(),
                doc.job_data_str("run_name")
                    .unwrap_or_else(|| "diffused".to_string()),
            ]);

            let command = plugin::build_main_command(&plugin_dir, &args);
            // No setup phase for diffusion plugins; their dependencies
            // ship with the base environment
            launch_local(&doc.id, command, None, env_vars, job_dir).await
        }

        // TRAIN and the remaining plugin types share the input-file path
        _ => {
            let mut template_config = doc.config();
            let model_name = safe_filename(
                template_config
                    .get("model_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            );
            let adaptor_name = template_config
                .get("adaptor_name")
                .and_then(Value::as_str)
                .unwrap_or("adaptor")
                .to_string();
            let template_name = template_config
                .get("template_name")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();

            template_config.insert("job_id".to_string(), json!(doc.id));
            template_config.insert(
                "adaptor_output_dir".to_string(),
                json!(storage::join(
                    ctx.ws.root(),
                    &["adaptors", &model_name, &adaptor_name]
                )),
            );
            let output_dir = storage::join(exp.dir(), &["tensorboards", &template_name]);
            template_config.insert("output_dir".to_string(), json!(output_dir));
            job.set_tensorboard_output_dir(&output_dir).await?;

            if truthy(template_config.get("run_sweeps")) {
                return sweep::run_sweep(
                    ctx,
                    &job,
                    &experiment_details,
                    &experiment_name,
                    template_config,
                    &plugin_dir,
                    setup,
                    env_vars,
                )
                .await;
            }

            let input_file = write_input_file(
                &ctx.ws,
                &format!("plugin_input_{}.json", safe_filename(&doc.id)),
                &experiment_details,
                &Value::Object(template_config),
            )
            .await?;

            let args = vec![
                "--input_file".to_string(),
                input_file,
                "--experiment_name".to_string(),
                experiment_name.clone(),
            ];
            let command = plugin::build_main_command(&plugin_dir, &args);
            launch_local(&doc.id, command, setup, env_vars, job_dir).await
        }
    };

    match launch {
        Ok(pid) => {
            job.update_job_data_field("provider_name", json!("local"))
                .await?;
            job.update_job_data_field("cluster_name", json!(doc.id))
                .await?;
            job.update_job_data_field("start_time", json!(chrono::Utc::now().to_rfc3339()))
                .await?;
            job.update_status(JobStatus::Running).await?;
            debug!("Job {} launched with pid {}", doc.id, pid);
            Ok(RunOutcome::Running {
                job_id: doc.id.clone(),
                message: format!("{} job launched successfully", doc.job_type),
            })
        }
        Err(e) => fail_job(&job, &format!("{} job launch failed: {}", doc.job_type, e)).await,
    }
}

/// Remove decoded base64 fields from the stored `job_data.config`,
/// tolerating a JSON-string-encoded config.
async fn strip_base64_from_stored_config(job: &Job, removed: &[&str]) -> Result<()> {
    let job_data = job.job_data().await?;
    let stored = match job_data.get("config") {
        Some(c) => c.clone(),
        None => return Ok(()),
    };

    let was_encoded = stored.is_string();
    let mut config = match &stored {
        Value::Object(m) => m.clone(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        _ => return Ok(()),
    };

    let mut updated = false;
    for key in removed {
        if config.remove(*key).is_some() {
            updated = true;
        }
    }
    if !updated {
        return Ok(());
    }

    let new_value = if was_encoded {
        json!(serde_json::to_string(&Value::Object(config))?)
    } else {
        Value::Object(config)
    };
    job.update_job_data_field("config", new_value).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_render_bare_scalars_and_json_lists() {
        assert_eq!(flag_value(&json!("x")), "x");
        assert_eq!(flag_value(&json!(3)), "3");
        assert_eq!(flag_value(&json!(true)), "true");
        assert_eq!(flag_value(&json!(["a", "b"])), "[\"a\",\"b\"]");
    }

    #[test]
    fn experiment_config_decodes_nested_json() {
        let doc = json!({
            "id": "e",
            "config": "{\"foundation\": \"m\", \"inferenceParams\": \"{\\\"temp\\\": 0.5}\"}"
        });
        let decoded = decoded_experiment(&doc);
        assert_eq!(
            decoded["config"]["inferenceParams"]["temp"],
            json!(0.5)
        );
        assert_eq!(decoded["config"]["foundation"], json!("m"));
    }

    #[test]
    fn truthiness() {
        assert!(truthy(Some(&json!(true))));
        assert!(truthy(Some(&json!("on"))));
        assert!(truthy(Some(&json!("Yes"))));
        assert!(!truthy(Some(&json!("false"))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(None));
    }
}
