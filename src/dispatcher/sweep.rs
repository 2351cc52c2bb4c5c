//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Hyperparameter sweeps for training jobs.
//!
//! The sweep enumerates the Cartesian product of the configured
//! parameter values, runs each configuration sequentially through the
//! local provider, scores it from the `metrics.json` the plugin writes
//! into its run directory, and persists a `sweep_results.json` summary.
//! Optionally the best configuration trains once more through the
//! standard launch path.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use itertools::Itertools;
use log::info;
use log::warn;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::dispatcher::plugin;
use crate::dispatcher::run_job::{launch_local, write_input_file, DispatchContext, RunOutcome};
use crate::provider::local::LocalProvider;
use crate::provider::models::ClusterState;
use crate::provider::ComputeProvider;
use crate::storage;
use crate::store::job::{Job, JobStatus};
use crate::util::slug::safe_filename;

fn default_sweep_config() -> Map<String, Value> {
    let mut config = Map::new();
    config.insert(
        "learning_rate".to_string(),
        json!(["1e-5", "3e-5", "5e-5"]),
    );
    config
}

fn parse_sweep_config(raw: Option<&Value>) -> Map<String, Value> {
    let parsed = match raw {
        Some(Value::Object(m)) => Some(m.clone()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_object().cloned()),
        _ => None,
    };
    match parsed.filter(|m| !m.is_empty()) {
        Some(config) => config,
        None => default_sweep_config(),
    }
}

/// All combinations of the sweep parameters, in declaration order.
fn enumerate_configs(sweep_config: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let param_names: Vec<&String> = sweep_config.keys().collect();
    let param_values: Vec<Vec<Value>> = sweep_config
        .values()
        .map(|v| v.as_array().cloned().unwrap_or_else(|| vec![v.clone()]))
        .collect();

    param_values
        .into_iter()
        .multi_cartesian_product()
        .map(|values| {
            param_names
                .iter()
                .zip(values)
                .map(|(name, value)| ((*name).clone(), value))
                .collect()
        })
        .collect()
}

/// Block until the process behind a local run directory has exited.
async fn wait_for_run(run_dir: &Path, cluster_name: &str) {
    let provider = LocalProvider::for_run(run_dir.to_path_buf());
    loop {
        let up = provider
            .get_cluster_status(cluster_name)
            .map(|s| s.state == ClusterState::Up)
            .unwrap_or(false);
        if !up {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run_sweep(
    ctx: &DispatchContext<'_>,
    job: &Job,
    experiment_details: &Value,
    experiment_name: &str,
    template_config: Map<String, Value>,
    plugin_dir: &Path,
    setup: Option<String>,
    env_vars: BTreeMap<String, String>,
) -> Result<RunOutcome> {
    let job_id = job.id().to_string();
    info!("Hyperparameter sweep requested for job {}", job_id);
    job.update_status(JobStatus::Running).await?;

    let sweep_config = parse_sweep_config(template_config.get("sweep_config"));
    let configs = enumerate_configs(&sweep_config);
    let total = configs.len();
    info!("Generated {} configurations for sweep {}", total, job_id);

    let output_dir = template_config
        .get("output_dir")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let sweep_dir = storage::join(&output_dir, &[&format!("sweep_{}", job_id)]);
    ctx.ws.storage().makedirs(&sweep_dir).await?;

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

    job.update_job_data_field("sweep_total", json!(total.to_string()))
        .await?;
    job.update_job_data_field("sweep_current", json!("0")).await?;

    let metric_name = template_config
        .get("sweep_metric")
        .and_then(Value::as_str)
        .unwrap_or("eval/loss")
        .to_string();
    let lower_is_better = template_config
        .get("lower_is_better")
        .and_then(Value::as_str)
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "yes" | "on"))
        .unwrap_or(true);
    let mut best_metric = if lower_is_better {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    };
    let mut best_config: Option<Map<String, Value>> = None;
    let mut results: Vec<Value> = Vec::new();

    let run_output_file = storage::join(&sweep_dir, &[&format!("output_sweep_{}.txt", job_id)]);
    job.update_job_data_field("sweep_output_file", json!(run_output_file))
        .await?;

    for (i, config_params) in configs.iter().enumerate() {
        let run_no = i + 1;
        info!("Sweep {}: configuration {}/{}", job_id, run_no, total);

        let run_dir = storage::join(&sweep_dir, &[&format!("run_{}", run_no)]);
        ctx.ws.storage().makedirs(&run_dir).await?;
        let run_adaptor_dir = storage::join(
            ctx.ws.root(),
            &[
                "adaptors",
                &model_name,
                &format!("{}_sweep_{}", adaptor_name, run_no),
            ],
        );
        ctx.ws.storage().makedirs(&run_adaptor_dir).await?;

        let mut run_config = template_config.clone();
        for (param, value) in config_params {
            run_config.insert(param.clone(), value.clone());
        }
        run_config.insert("output_dir".to_string(), json!(run_dir));
        run_config.insert("adaptor_output_dir".to_string(), json!(run_adaptor_dir));

        let input_file = write_input_file(
            &ctx.ws,
            &format!("plugin_input_{}_run_{}.json", job_id, run_no),
            experiment_details,
            &Value::Object(run_config),
        )
        .await?;

        job.update_job_data_field(
            "sweep_progress",
            json!(((i as f64 / total as f64) * 100.0) as i64),
        )
        .await?;
        job.update_job_data_field("sweep_current", json!(run_no.to_string()))
            .await?;
        job.update_job_data_field(
            "sweep_running_config",
            json!(serde_json::to_string(config_params)?),
        )
        .await?;

        let command = plugin::build_main_command(
            plugin_dir,
            &[
                "--input_file".to_string(),
                input_file,
                "--experiment_name".to_string(),
                experiment_name.to_string(),
            ],
        );

        let sweep_run_name = format!("{}_sweep_run_{}", job_id, run_no);
        let sweep_job_dir = ctx.ws.local_job_dir(&sweep_run_name);

        match launch_local(
            &sweep_run_name,
            command,
            setup.clone(),
            env_vars.clone(),
            sweep_job_dir.clone(),
        )
        .await
        {
            Ok(_) => {
                wait_for_run(&sweep_job_dir, &sweep_run_name).await;
                append_run_logs(ctx, &run_output_file, &sweep_job_dir, run_no, total).await;
            }
            Err(e) => {
                // A failed run is recorded and the sweep continues
                warn!("Sweep {} run {} launch error: {}", job_id, run_no, e);
                results.push(json!({
                    "config": config_params,
                    "error": e.to_string(),
                    "run_dir": run_dir,
                    "adaptor_dir": run_adaptor_dir,
                }));
                continue;
            }
        }

        // Sweep adaptors are scratch output
        if ctx.ws.storage().isdir(&run_adaptor_dir).await.unwrap_or(false) {
            let _ = ctx.ws.storage().rm_tree(&run_adaptor_dir).await;
        }

        let run_metrics = read_run_metrics(ctx, &run_dir, &metric_name).await;
        results.push(json!({
            "config": config_params,
            "metrics": run_metrics,
            "run_dir": run_dir,
            "adaptor_dir": run_adaptor_dir,
        }));

        if let Some(metric_value) = run_metrics.get(&metric_name).and_then(Value::as_f64) {
            let is_better = (lower_is_better && metric_value < best_metric)
                || (!lower_is_better && metric_value > best_metric);
            if best_config.is_none() || is_better {
                best_metric = metric_value;
                best_config = Some(config_params.clone());
                job.update_job_data_field(
                    "sweep_best_config",
                    json!(serde_json::to_string(config_params)?),
                )
                .await?;
                job.update_job_data_field(
                    "sweep_best_metric",
                    json!(serde_json::to_string(&json!({ &metric_name: best_metric }))?),
                )
                .await?;
            }
        }
    }

    let sweep_results = json!({
        "sweep_config": sweep_config,
        "results": results,
        "best_config": best_config,
        "best_metric": { &metric_name: best_metric },
        "metric_name": metric_name,
        "lower_is_better": lower_is_better,
    });
    let sweep_results_file = storage::join(&sweep_dir, &["sweep_results.json"]);
    ctx.ws
        .storage()
        .write(
            &sweep_results_file,
            serde_json::to_string_pretty(&sweep_results)?.as_bytes(),
        )
        .await?;
    job.update_job_data_field("sweep_results_file", json!(sweep_results_file))
        .await?;
    job.update_job_data_field("sweep_progress", json!(100)).await?;

    info!(
        "Sweep {} completed; best {} = {}",
        job_id, metric_name, best_metric
    );

    let train_final_model = match template_config.get("train_final_model") {
        Some(v) => super::run_job::truthy(Some(v)),
        None => true,
    };

    if let (true, Some(best)) = (train_final_model, best_config) {
        info!("Sweep {}: training final model with best configuration", job_id);
        let mut final_config = template_config.clone();
        for (param, value) in best {
            final_config.insert(param, value);
        }
        let input_file = write_input_file(
            &ctx.ws,
            &format!("plugin_input_{}_final.json", job_id),
            experiment_details,
            &Value::Object(final_config),
        )
        .await?;
        let command = plugin::build_main_command(
            plugin_dir,
            &[
                "--input_file".to_string(),
                input_file,
                "--experiment_name".to_string(),
                experiment_name.to_string(),
            ],
        );

        let job_dir = ctx.ws.local_job_dir(&job_id);
        launch_local(&job_id, command, setup, env_vars, job_dir).await?;
        return Ok(RunOutcome::Running {
            job_id,
            message: "Sweep complete; final training launched".to_string(),
        });
    }

    job.update_status(JobStatus::Complete).await?;
    Ok(RunOutcome::Complete { job_id })
}

async fn append_run_logs(
    ctx: &DispatchContext<'_>,
    run_output_file: &str,
    sweep_job_dir: &Path,
    run_no: usize,
    total: usize,
) {
    let mut combined = ctx
        .ws
        .storage()
        .read_to_string(run_output_file)
        .await
        .unwrap_or_default();

    if let Ok(stdout) = std::fs::read_to_string(sweep_job_dir.join("stdout.log")) {
        for line in stdout.lines() {
            combined.push_str(&format!("\n[Run {}/{}]: {}", run_no, total, line));
        }
    }
    if let Ok(stderr) = std::fs::read_to_string(sweep_job_dir.join("stderr.log")) {
        if !stderr.is_empty() {
            for line in stderr.lines() {
                combined.push_str(&format!("\n[Run {}/{} ERROR]: {}", run_no, total, line));
            }
        }
    }

    if let Err(e) = ctx
        .ws
        .storage()
        .write(run_output_file, combined.as_bytes())
        .await
    {
        warn!("Could not write sweep log {}: {}", run_output_file, e);
    }
}

/// Read the metrics the plugin left in the run directory. Missing or
/// unreadable metrics score zero for the configured metric.
async fn read_run_metrics(
    ctx: &DispatchContext<'_>,
    run_dir: &str,
    metric_name: &str,
) -> Map<String, Value> {
    let metrics_path = storage::join(run_dir, &["metrics.json"]);
    let fallback = || {
        let mut m = Map::new();
        m.insert(metric_name.to_string(), json!(0.0));
        m
    };

    match ctx.ws.storage().read_to_string(&metrics_path).await {
        Ok(content) => serde_json::from_str::<Value>(content.trim())
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_else(fallback),
        Err(_) => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_config_parses_strings_and_defaults() {
        let parsed = parse_sweep_config(Some(&json!({"lr": ["1", "2"]})));
        assert_eq!(parsed.get("lr").unwrap().as_array().unwrap().len(), 2);

        let parsed = parse_sweep_config(Some(&json!("{\"rank\": [8, 16]}")));
        assert!(parsed.contains_key("rank"));

        let parsed = parse_sweep_config(None);
        assert!(parsed.contains_key("learning_rate"));

        let parsed = parse_sweep_config(Some(&json!("not json")));
        assert!(parsed.contains_key("learning_rate"));
    }

    #[test]
    fn config_enumeration_is_a_cartesian_product() {
        let mut sweep_config = Map::new();
        sweep_config.insert("lr".to_string(), json!(["1e-5", "3e-5"]));
        sweep_config.insert("rank".to_string(), json!([8, 16, 32]));

        let configs = enumerate_configs(&sweep_config);
        assert_eq!(configs.len(), 6);
        assert!(configs
            .iter()
            .any(|c| c["lr"] == json!("3e-5") && c["rank"] == json!(32)));
    }

    #[test]
    fn single_parameter_sweep() {
        let mut sweep_config = Map::new();
        sweep_config.insert("batch".to_string(), json!([4]));
        let configs = enumerate_configs(&sweep_config);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["batch"], json!(4));
    }
}
