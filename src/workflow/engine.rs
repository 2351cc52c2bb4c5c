//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Workflow traversal: advance a run by queueing jobs for the next
//! layer of nodes, wiring previous outputs into their inputs.
//!
//! START nodes are structural only and are never emitted as next tasks;
//! they always skip to their successors.

use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use log::info;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::storage::Workspace;
use crate::store::experiment::Experiment;
use crate::store::job::{Job, JobStatus, JobType};
use crate::store::task::Task;
use crate::workflow::io::{extract_previous_job_outputs, prepare_next_task_io};
use crate::workflow::model::*;

/// Aggregate state of a run's child jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobsStatus {
    Failed,
    Cancelled,
    Running,
    AllComplete,
}

/// One engine step's result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressOutcome {
    Failed,
    Cancelled,
    /// Child jobs still in flight; nothing to do
    Waiting,
    /// New jobs queued for the next layer
    Queued(Vec<String>),
    Complete,
}

#[derive(Clone, Debug)]
pub struct CancelSummary {
    pub message: String,
    pub cancelled_jobs: Vec<String>,
    pub note: String,
}

/// Classify the run's child jobs: any FAILED wins, then any cancelled
/// flavor, then anything still moving. All COMPLETE reads as done.
pub async fn check_current_jobs_status(
    ws: &Workspace,
    job_ids: &[String],
) -> Result<JobsStatus> {
    let mut any_running = false;
    for job_id in job_ids {
        let job = match Job::get(ws, job_id).await {
            Ok(j) => j,
            Err(_) => continue,
        };
        match job.status().await? {
            JobStatus::Failed => return Ok(JobsStatus::Failed),
            JobStatus::Cancelled | JobStatus::Deleted | JobStatus::Stopped => {
                return Ok(JobsStatus::Cancelled)
            }
            JobStatus::Running | JobStatus::Queued | JobStatus::Launching => {
                any_running = true;
            }
            JobStatus::Complete | JobStatus::NotStarted => {}
        }
    }
    if any_running {
        Ok(JobsStatus::Running)
    } else {
        Ok(JobsStatus::AllComplete)
    }
}

/// Replace START nodes in a node id list by the union of their
/// successors. Returns the resolved ids and their nodes.
pub fn handle_start_node_skip<'a>(
    node_ids: &[String],
    config: &'a WorkflowConfig,
) -> (Vec<String>, Vec<&'a Node>) {
    let mut actual_ids = Vec::new();
    for node in config.nodes_by_ids(node_ids) {
        match node.node_type {
            NodeType::Start => {
                for next_id in &node.out {
                    if !actual_ids.contains(next_id) {
                        actual_ids.push(next_id.clone());
                    }
                }
            }
            NodeType::Task => {
                if !actual_ids.contains(&node.id) {
                    actual_ids.push(node.id.clone());
                }
            }
        }
    }
    let nodes = config.nodes_by_ids(&actual_ids);
    (actual_ids, nodes)
}

/// The next layer after the current nodes: all outputs flattened, with
/// START nodes skipped through to their successors.
pub fn determine_next_tasks(current: &[String], config: &WorkflowConfig) -> Vec<String> {
    let mut next = Vec::new();
    for node in config.nodes_by_ids(current) {
        for next_id in &node.out {
            match config.node(next_id) {
                Some(n) if n.node_type == NodeType::Start => {
                    // Re-entry through a START node skips it
                    let (skipped, _) = handle_start_node_skip(&[next_id.clone()], config);
                    for id in skipped {
                        if !next.contains(&id) {
                            next.push(id);
                        }
                    }
                }
                Some(_) => {
                    if !next.contains(next_id) {
                        next.push(next_id.clone());
                    }
                }
                None => {}
            }
        }
    }
    next
}

/// The declared IO and type of the task a node executes, from the node
/// itself or the stored task definition it references.
async fn resolve_task_definition(
    ws: &Workspace,
    node: &Node,
) -> (String, Option<String>, Option<String>, Map<String, Value>) {
    let mut task_type = node.task_type.clone();
    let mut inputs = node.inputs.clone();
    let mut outputs = node.outputs.clone();
    let mut config: Map<String, Value> = Default::default();

    if let Some(task_name) = node.task.as_deref().filter(|t| !t.is_empty()) {
        if let Ok(task) = Task::get(ws, task_name).await {
            if let Ok(data) = task.resource().json_data().await {
                if task_type.is_none() {
                    task_type = data.get("type").and_then(Value::as_str).map(String::from);
                }
                if inputs.is_none() {
                    inputs = data.get("inputs").and_then(Value::as_str).map(String::from);
                }
                if outputs.is_none() {
                    outputs = data
                        .get("outputs")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
                if let Some(c) = data.get("config").and_then(Value::as_object) {
                    config = c.clone();
                }
            }
        }
    }

    (
        task_type.unwrap_or_else(|| "TASK".to_string()),
        inputs,
        outputs,
        config,
    )
}

/// Outputs of the most recent completed parent job of a node.
async fn previous_outputs_for(
    ws: &Workspace,
    run: &WorkflowRunDocument,
    config: &WorkflowConfig,
    node_id: &str,
) -> Map<String, Value> {
    let mut outputs = Map::new();

    for parent in config.nodes.iter().filter(|n| n.out.contains(&node_id.to_string())) {
        let job_id = match run
            .node_metadata
            .get(&parent.id)
            .and_then(|m| m.get("job_id"))
            .and_then(Value::as_str)
        {
            Some(id) => id.to_string(),
            None => continue,
        };
        let job = match Job::get(ws, &job_id).await {
            Ok(j) => j,
            Err(_) => continue,
        };
        let doc = match job.document().await {
            Ok(d) => d,
            Err(_) => continue,
        };
        if doc.status != JobStatus::Complete {
            continue;
        }
        // Later parents win on key collisions
        for (k, v) in extract_previous_job_outputs(&doc) {
            outputs.insert(k, v);
        }
    }

    outputs
}

/// Advance a run by one step.
pub async fn progress_workflow(ws: &Workspace, run_id: &str) -> Result<ProgressOutcome> {
    let run = WorkflowRun::get(ws, run_id).await?;
    let doc = run.document().await?;

    match doc.status {
        WorkflowRunStatus::Complete => return Ok(ProgressOutcome::Complete),
        WorkflowRunStatus::Failed => return Ok(ProgressOutcome::Failed),
        WorkflowRunStatus::Cancelled => return Ok(ProgressOutcome::Cancelled),
        _ => {}
    }

    let workflow = Workflow::get(ws, &doc.workflow_id)
        .await
        .map_err(|_| anyhow!("Workflow {} for run {} not found", doc.workflow_id, run_id))?;
    let config = workflow.config().await?;

    if !doc.jobs.is_empty() {
        match check_current_jobs_status(ws, &doc.jobs).await? {
            JobsStatus::Failed => {
                run.set_status(WorkflowRunStatus::Failed).await?;
                return Ok(ProgressOutcome::Failed);
            }
            JobsStatus::Cancelled => {
                run.set_status(WorkflowRunStatus::Cancelled).await?;
                return Ok(ProgressOutcome::Cancelled);
            }
            JobsStatus::Running => return Ok(ProgressOutcome::Waiting),
            JobsStatus::AllComplete => {}
        }
    }

    let next_ids = if doc.current_tasks.is_empty() {
        let start_ids: Vec<String> = config.start_nodes().iter().map(|n| n.id.clone()).collect();
        let (actual, _) = handle_start_node_skip(&start_ids, &config);
        actual
    } else {
        determine_next_tasks(&doc.current_tasks, &config)
    };

    if next_ids.is_empty() {
        run.set_status(WorkflowRunStatus::Complete).await?;
        info!("Workflow run {} complete", run_id);
        return Ok(ProgressOutcome::Complete);
    }

    let experiment_name = if doc.experiment_id.is_empty() {
        "default".to_string()
    } else {
        doc.experiment_id.clone()
    };
    let exp = Experiment::create_or_get(ws, &experiment_name).await?;

    let mut queued = Vec::new();
    for node_id in &next_ids {
        let node = match config.node(node_id) {
            Some(n) => n,
            None => continue,
        };

        let (task_type, declared_inputs, declared_outputs, task_config) =
            resolve_task_definition(ws, node).await;
        let previous = previous_outputs_for(ws, &doc, &config, node_id).await;
        let (inputs, outputs) = prepare_next_task_io(
            &task_type,
            declared_inputs.as_deref(),
            declared_outputs.as_deref(),
            &previous,
        );

        let job = exp.create_job().await?;
        let job_type = task_type.parse::<JobType>().unwrap_or(JobType::Undefined);
        job.set_type(job_type).await?;
        if !task_config.is_empty() {
            job.update_job_data_field("config", Value::Object(task_config))
                .await?;
        }
        job.update_job_data_field("inputs", json!(inputs)).await?;
        job.update_job_data_field("outputs", json!(outputs)).await?;
        job.update_job_data_field("workflow_run_id", json!(run_id))
            .await?;
        job.update_job_data_field("node_id", json!(node_id)).await?;
        job.update_status(JobStatus::Queued).await?;
        exp.add_job(job.id(), job_type).await?;

        run.update_node_metadata(node_id, json!({ "job_id": job.id() }))
            .await?;
        debug!(
            "Workflow run {}: queued job {} for node {}",
            run_id,
            job.id(),
            node_id
        );
        queued.push(job.id().to_string());
    }

    run.append_jobs(&queued).await?;
    run.set_current_tasks(&next_ids).await?;
    run.set_status(WorkflowRunStatus::Running).await?;

    Ok(ProgressOutcome::Queued(queued))
}

/// Start a new run for a workflow owned by the experiment. `None` when
/// the workflow is missing or owned elsewhere.
pub async fn start_workflow_run(
    ws: &Workspace,
    workflow_id: &str,
    experiment_id: &str,
) -> Result<Option<WorkflowRun>> {
    if Workflow::get_owned(ws, workflow_id, experiment_id)
        .await?
        .is_none()
    {
        return Ok(None);
    }
    let run = WorkflowRun::create(ws, workflow_id, experiment_id).await?;
    Ok(Some(run))
}

/// Cancel a run: the run turns CANCELLED and every still-active child
/// job goes through the standard stop path (stop flag plus STOPPED).
/// `None` when the run does not belong to the experiment.
pub async fn cancel_workflow_run(
    ws: &Workspace,
    experiment_id: &str,
    run_id: &str,
) -> Result<Option<CancelSummary>> {
    let run = match WorkflowRun::get(ws, run_id).await {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };
    let doc = run.document().await?;
    if doc.experiment_id != experiment_id {
        return Ok(None);
    }

    run.set_status(WorkflowRunStatus::Cancelled).await?;

    let mut cancelled_jobs = Vec::new();
    for job_id in &doc.jobs {
        let job = match Job::get(ws, job_id).await {
            Ok(j) => j,
            Err(_) => continue,
        };
        if matches!(
            job.status().await?,
            JobStatus::Queued | JobStatus::Launching | JobStatus::Running
        ) {
            job.stop().await?;
            cancelled_jobs.push(job_id.clone());
        }
    }

    Ok(Some(CancelSummary {
        message: format!("Workflow run {} cancelled", run_id),
        cancelled_jobs,
        note: "Running jobs observe the stop flag and exit".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: NodeType, out: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            node_type,
            name: id.to_string(),
            task: None,
            inputs: None,
            outputs: None,
            task_type: None,
            out: out.iter().map(|s| s.to_string()).collect(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn next_tasks_flatten_all_outputs() {
        let config = WorkflowConfig {
            nodes: vec![
                node("task1", NodeType::Task, &["task2", "task3"]),
                node("task2", NodeType::Task, &[]),
                node("task3", NodeType::Task, &[]),
            ],
        };
        let next = determine_next_tasks(&["task1".to_string()], &config);
        assert_eq!(next, vec!["task2".to_string(), "task3".to_string()]);
    }

    #[test]
    fn next_tasks_empty_for_empty_config() {
        let config = WorkflowConfig::default();
        assert!(determine_next_tasks(&[], &config).is_empty());
    }

    #[test]
    fn start_nodes_skip_to_successors() {
        let config = WorkflowConfig {
            nodes: vec![
                node("start1", NodeType::Start, &["task1"]),
                node("start2", NodeType::Start, &["task2"]),
                node("task1", NodeType::Task, &[]),
                node("task2", NodeType::Task, &[]),
            ],
        };
        let (ids, nodes) =
            handle_start_node_skip(&["start1".to_string(), "start2".to_string()], &config);
        assert_eq!(ids, vec!["task1".to_string(), "task2".to_string()]);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn reentrant_start_nodes_are_skipped_in_next_layer() {
        let config = WorkflowConfig {
            nodes: vec![
                node("task1", NodeType::Task, &["start"]),
                node("start", NodeType::Start, &["task2"]),
                node("task2", NodeType::Task, &[]),
            ],
        };
        let next = determine_next_tasks(&["task1".to_string()], &config);
        assert_eq!(next, vec!["task2".to_string()]);
    }

    #[test]
    fn task_nodes_pass_through_skip_helper() {
        let config = WorkflowConfig {
            nodes: vec![node("task1", NodeType::Task, &["x"])],
        };
        let (ids, _) = handle_start_node_skip(&["task1".to_string()], &config);
        assert_eq!(ids, vec!["task1".to_string()]);
    }

    use crate::storage::{OrgContext, Workspace};
    use serde_json::json;

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

    fn task_node(id: &str, task_type: &str, inputs: &str, outputs: &str, out: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::Task,
            name: id.to_string(),
            task: None,
            inputs: Some(inputs.to_string()),
            outputs: Some(outputs.to_string()),
            task_type: Some(task_type.to_string()),
            out: out.iter().map(|s| s.to_string()).collect(),
            metadata: Default::default(),
        }
    }

    async fn two_step_workflow(ws: &Workspace) -> Workflow {
        let config = WorkflowConfig {
            nodes: vec![
                node("start", NodeType::Start, &["task1"]),
                task_node("task1", "TRAIN", "{}", r#"{"model_name": ""}"#, &["task2"]),
                task_node("task2", "EVAL", r#"{"model_name": ""}"#, "{}", &[]),
            ],
        };
        Workflow::create(ws, "wf1", "train then eval", "alpha", &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn train_then_eval_wires_model_name_through() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        Experiment::create(&ws, "alpha").await.unwrap();
        two_step_workflow(&ws).await;

        let run = start_workflow_run(&ws, "wf1", "alpha")
            .await
            .unwrap()
            .unwrap();

        // first step: the START node skips straight to task1
        let outcome = progress_workflow(&ws, run.id()).await.unwrap();
        let first_jobs = match outcome {
            ProgressOutcome::Queued(jobs) => jobs,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(first_jobs.len(), 1);

        // the train job finishes having configured a model name
        let train_job = Job::get(&ws, &first_jobs[0]).await.unwrap();
        train_job
            .update_job_data_field("config", json!({ "model_name": "abc" }))
            .await
            .unwrap();
        train_job.update_status(JobStatus::Complete).await.unwrap();
        // its recorded type drives the output extraction
        train_job
            .set_type(crate::store::job::JobType::Train)
            .await
            .unwrap();

        // second step: task2 is queued with the model name wired in
        let outcome = progress_workflow(&ws, run.id()).await.unwrap();
        let second_jobs = match outcome {
            ProgressOutcome::Queued(jobs) => jobs,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(second_jobs.len(), 1);

        let eval_job = Job::get(&ws, &second_jobs[0]).await.unwrap();
        let inputs_raw = eval_job
            .job_data()
            .await
            .unwrap()
            .get("inputs")
            .and_then(serde_json::Value::as_str)
            .unwrap()
            .to_string();
        let inputs: serde_json::Value = serde_json::from_str(&inputs_raw).unwrap();
        assert_eq!(inputs["model_name"], json!("abc"));

        // once task2 completes, the run is done
        eval_job.update_status(JobStatus::Complete).await.unwrap();
        let outcome = progress_workflow(&ws, run.id()).await.unwrap();
        assert_eq!(outcome, ProgressOutcome::Complete);
        assert_eq!(
            run.document().await.unwrap().status,
            WorkflowRunStatus::Complete
        );
    }

    #[tokio::test]
    async fn failed_child_job_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        Experiment::create(&ws, "alpha").await.unwrap();
        two_step_workflow(&ws).await;

        let run = start_workflow_run(&ws, "wf1", "alpha")
            .await
            .unwrap()
            .unwrap();
        let jobs = match progress_workflow(&ws, run.id()).await.unwrap() {
            ProgressOutcome::Queued(jobs) => jobs,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let job = Job::get(&ws, &jobs[0]).await.unwrap();
        job.update_status(JobStatus::Failed).await.unwrap();

        let outcome = progress_workflow(&ws, run.id()).await.unwrap();
        assert_eq!(outcome, ProgressOutcome::Failed);
        assert_eq!(
            run.document().await.unwrap().status,
            WorkflowRunStatus::Failed
        );
    }

    #[tokio::test]
    async fn cancelling_a_run_stops_active_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        Experiment::create(&ws, "alpha").await.unwrap();
        two_step_workflow(&ws).await;

        let run = start_workflow_run(&ws, "wf1", "alpha")
            .await
            .unwrap()
            .unwrap();
        let jobs = match progress_workflow(&ws, run.id()).await.unwrap() {
            ProgressOutcome::Queued(jobs) => jobs,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let job = Job::get(&ws, &jobs[0]).await.unwrap();
        job.update_status(JobStatus::Running).await.unwrap();

        let summary = cancel_workflow_run(&ws, "alpha", run.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.cancelled_jobs, jobs);

        assert_eq!(
            run.document().await.unwrap().status,
            WorkflowRunStatus::Cancelled
        );
        assert!(job.should_stop().await.unwrap());
        assert_eq!(job.status().await.unwrap(), JobStatus::Stopped);
    }

    #[tokio::test]
    async fn foreign_experiment_cannot_touch_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        Experiment::create(&ws, "alpha").await.unwrap();
        two_step_workflow(&ws).await;

        let run = start_workflow_run(&ws, "wf1", "alpha")
            .await
            .unwrap()
            .unwrap();

        assert!(cancel_workflow_run(&ws, "other_exp", run.id())
            .await
            .unwrap()
            .is_none());
        assert!(start_workflow_run(&ws, "wf1", "other_exp")
            .await
            .unwrap()
            .is_none());
    }
}
