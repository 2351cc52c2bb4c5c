//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The job dispatcher: a single-flight background loop that pulls the
//! oldest QUEUED job across all organizations, scopes a workspace for
//! its org, launches it through the local provider and surfaces the
//! process state back into the store.
//!
//! There is exactly one dispatcher per process; at most one job is
//! RUNNING at any moment.

pub mod env;
pub mod failure;
pub mod plugin;
pub mod run_job;
pub mod sweep;

pub use run_job::{run_job, DispatchContext, RunOutcome};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde_json::json;

use crate::config::Configuration;
use crate::provider::local::LocalProvider;
use crate::provider::models::ClusterState;
use crate::provider::router::ProviderRouter;
use crate::provider::ComputeProvider;
use crate::storage::{self, OrgContext, Storage, Workspace};
use crate::store::job::{Job, JobStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A job was picked and dispatched
    Started { job_id: String, message: String },
    /// Another job is RUNNING somewhere; nothing was dispatched
    AlreadyRunning,
    /// No QUEUED job anywhere
    QueueEmpty,
}

impl DrainOutcome {
    pub fn message(&self) -> String {
        match self {
            DrainOutcome::Started { message, .. } => message.clone(),
            DrainOutcome::AlreadyRunning => "A job is already running".to_string(),
            DrainOutcome::QueueEmpty => "No jobs in queue".to_string(),
        }
    }
}

pub struct Dispatcher {
    config: Arc<Configuration>,
    router: Arc<ProviderRouter>,
}

impl Dispatcher {
    pub fn new(config: Arc<Configuration>) -> Dispatcher {
        let router = Arc::new(ProviderRouter::load(
            config.providers_file().as_deref(),
        ));
        Dispatcher { config, router }
    }

    /// All workspaces this process schedules for: one per organization
    /// directory, plus the anonymous workspace.
    async fn workspaces(&self) -> Result<Vec<Workspace>> {
        let mut workspaces = vec![Workspace::resolve(&self.config, OrgContext::anonymous())?];

        if let Some(orgs_base) = Workspace::orgs_base(&self.config) {
            let storage = Storage::for_root(&orgs_base)?;
            for entry in storage.ls(&orgs_base).await.unwrap_or_default() {
                if !storage.isdir(&entry).await.unwrap_or(false) {
                    continue;
                }
                let org_id = storage::file_name(&entry).to_string();
                if org_id.is_empty() {
                    continue;
                }
                workspaces.push(Workspace::resolve(
                    &self.config,
                    OrgContext::for_org(org_id),
                )?);
            }
        }

        Ok(workspaces)
    }

    /// Drain one job from the queue.
    ///
    /// Does nothing while any job is RUNNING anywhere (single-flight).
    /// The oldest QUEUED job across orgs wins, ordered by numeric id.
    /// The org scope for the picked job lives exactly as long as the
    /// dispatch.
    pub async fn start_next_job(&self) -> Result<DrainOutcome> {
        let workspaces = self.workspaces().await?;

        for ws in &workspaces {
            if Job::count_running(ws).await? > 0 {
                return Ok(DrainOutcome::AlreadyRunning);
            }
        }

        let mut candidate: Option<(u64, crate::store::job::JobDocument, &Workspace)> = None;
        for ws in &workspaces {
            if let Some(doc) = Job::next_queued(ws).await? {
                let numeric = doc.id.parse::<u64>().unwrap_or(0);
                let replace = match &candidate {
                    Some((current, _, _)) => numeric < *current,
                    None => true,
                };
                if replace {
                    candidate = Some((numeric, doc, ws));
                }
            }
        }

        let (_, doc, ws) = match candidate {
            Some(c) => c,
            None => return Ok(DrainOutcome::QueueEmpty),
        };

        info!(
            "Starting next job in queue: {} (org = {:?})",
            doc.id,
            ws.org().org_id
        );

        let ctx = DispatchContext {
            config: &self.config,
            ws: ws.clone(),
            router: &self.router,
        };
        let outcome = run_job(&ctx, &doc).await?;

        Ok(DrainOutcome::Started {
            job_id: doc.id.clone(),
            message: match outcome {
                RunOutcome::Running { message, .. } => message,
                RunOutcome::Complete { .. } => "Job completed".to_string(),
                RunOutcome::Failed { message, .. } => message,
            },
        })
    }

    /// Surface process state into the store: RUNNING jobs whose local
    /// run has exited settle to COMPLETE, FAILED or STOPPED.
    pub async fn poll_running_jobs(&self) -> Result<()> {
        for ws in self.workspaces().await? {
            for doc in Job::scan(&ws).await? {
                if doc.status != JobStatus::Running {
                    continue;
                }
                if doc.job_data_str("provider_name").as_deref() != Some("local") {
                    continue;
                }
                if let Err(e) = self.finalize_if_exited(&ws, &doc.id).await {
                    warn!("Could not finalize job {}: {}", doc.id, e);
                }
            }
        }
        Ok(())
    }

    async fn finalize_if_exited(&self, ws: &Workspace, job_id: &str) -> Result<()> {
        let run_dir = ws.local_job_dir(job_id);
        let provider = LocalProvider::for_run(run_dir.clone());
        let state = {
            let name = job_id.to_string();
            tokio::task::spawn_blocking(move || {
                provider.get_cluster_status(&name).map(|s| s.state)
            })
            .await?
            .unwrap_or(ClusterState::Unknown)
        };
        if state == ClusterState::Up {
            return Ok(());
        }

        let job = Job::get(ws, job_id).await?;
        // Re-read: the plugin may have settled its own status
        let status = job.status().await?;
        if status != JobStatus::Running {
            return Ok(());
        }

        job.update_job_data_field("end_time", json!(chrono::Utc::now().to_rfc3339()))
            .await?;

        if job.should_stop().await? {
            debug!("Job {} exited after stop request", job_id);
            job.update_status(JobStatus::Stopped).await?;
            return Ok(());
        }

        let stderr_tail = std::fs::read_to_string(run_dir.join("stderr.log"))
            .map(|s| failure::tail_lines(&s, self.config.error_log_lines()))
            .unwrap_or_default();
        match failure::classify_output(&stderr_tail) {
            Some(kind) => {
                info!("Job {} failed: {}", job_id, kind.message());
                job.set_error_message(&kind.message()).await?;
                job.update_status(JobStatus::Failed).await?;
            }
            None => {
                debug!("Job {} completed", job_id);
                job.update_status(JobStatus::Complete).await?;
            }
        }
        Ok(())
    }

    /// Stop a job: set the cooperative stop flag, SIGTERM the local run
    /// and mark the job STOPPED.
    pub async fn stop_job(&self, ws: &Workspace, job_id: &str) -> Result<()> {
        let job = Job::get(ws, job_id).await?;
        job.update_job_data_field("stop", json!(true)).await?;

        let run_dir = ws.local_job_dir(job_id);
        if run_dir.is_dir() {
            let name = job_id.to_string();
            let provider = LocalProvider::for_run(run_dir);
            let _ = tokio::task::spawn_blocking(move || provider.stop_cluster(&name)).await?;
        }

        job.update_status(JobStatus::Stopped).await
    }

    /// The dispatcher loop: settle exited runs, then drain the queue.
    pub async fn serve(&self) -> Result<()> {
        info!("Dispatcher started");
        loop {
            if let Err(e) = self.poll_running_jobs().await {
                warn!("Polling running jobs failed: {}", e);
            }
            match self.start_next_job().await {
                Ok(DrainOutcome::Started { job_id, message }) => {
                    info!("Dispatched job {}: {}", job_id, message);
                }
                Ok(_) => {}
                Err(e) => warn!("Queue drain failed: {}", e),
            }
            tokio::time::sleep(Duration::from_secs(self.config.dispatch_interval())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::experiment::Experiment;
    use serde_json::json;
    use std::sync::Arc;

    fn test_config(tmp: &tempfile::TempDir) -> Arc<Configuration> {
        let mut cfg = config::Config::default();
        cfg.set("compatibility", "*").unwrap();
        cfg.set("home_dir", tmp.path().to_str().unwrap()).unwrap();
        Arc::new(
            cfg.try_into::<crate::config::NotValidatedConfiguration>()
                .unwrap()
                .validate()
                .unwrap(),
        )
    }

    async fn queue_job(exp: &Experiment, job_data: serde_json::Value) -> String {
        let job = exp.create_job().await.unwrap();
        if let Some(obj) = job_data.as_object() {
            for (k, v) in obj {
                if k == "type" {
                    continue;
                }
                job.update_job_data_field(k, v.clone()).await.unwrap();
            }
            if let Some(t) = job_data.get("type").and_then(serde_json::Value::as_str) {
                job.set_type(t.parse().unwrap()).await.unwrap();
            }
        }
        job.update_status(JobStatus::Queued).await.unwrap();
        job.id().to_string()
    }

    #[tokio::test]
    async fn second_job_waits_while_one_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let running = exp.create_job().await.unwrap();
        running.update_status(JobStatus::Running).await.unwrap();
        let queued_id = queue_job(&exp, json!({})).await;

        let dispatcher = Dispatcher::new(config);
        let outcome = dispatcher.start_next_job().await.unwrap();
        assert_eq!(outcome, DrainOutcome::AlreadyRunning);
        assert_eq!(outcome.message(), "A job is already running");

        let queued = Job::get(&ws, &queued_id).await.unwrap();
        assert_eq!(queued.status().await.unwrap(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn oldest_queued_job_is_picked_and_missing_plugin_fails_it() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let first = queue_job(&exp, json!({ "type": "EVAL", "plugin": "missing_plugin" })).await;
        let second = queue_job(&exp, json!({ "type": "EVAL", "plugin": "missing_plugin" })).await;

        let dispatcher = Dispatcher::new(config);
        match dispatcher.start_next_job().await.unwrap() {
            DrainOutcome::Started { job_id, .. } => assert_eq!(job_id, first),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let picked = Job::get(&ws, &first).await.unwrap();
        assert_eq!(picked.status().await.unwrap(), JobStatus::Failed);
        let error_msg = picked
            .job_data()
            .await
            .unwrap()
            .get("error_msg")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        assert!(error_msg.contains("No plugin found"));

        // the younger job is untouched
        let waiting = Job::get(&ws, &second).await.unwrap();
        assert_eq!(waiting.status().await.unwrap(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn empty_queue_reports_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let dispatcher = Dispatcher::new(config);
        assert_eq!(
            dispatcher.start_next_job().await.unwrap(),
            DrainOutcome::QueueEmpty
        );
    }

    #[tokio::test]
    async fn task_jobs_complete_without_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();
        let task_id = queue_job(&exp, json!({ "type": "TASK" })).await;

        let dispatcher = Dispatcher::new(config);
        dispatcher.start_next_job().await.unwrap();

        let task = Job::get(&ws, &task_id).await.unwrap();
        assert_eq!(task.status().await.unwrap(), JobStatus::Complete);
    }

    #[tokio::test]
    async fn exited_local_run_with_clean_stderr_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let job = exp.create_job().await.unwrap();
        job.update_job_data_field("provider_name", json!("local"))
            .await
            .unwrap();
        job.update_status(JobStatus::Running).await.unwrap();

        // run directory without a pid file reads as exited
        std::fs::create_dir_all(ws.local_job_dir(job.id())).unwrap();

        let dispatcher = Dispatcher::new(config);
        dispatcher.poll_running_jobs().await.unwrap();
        assert_eq!(job.status().await.unwrap(), JobStatus::Complete);
    }

    #[tokio::test]
    async fn exited_local_run_with_error_output_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let job = exp.create_job().await.unwrap();
        job.update_job_data_field("provider_name", json!("local"))
            .await
            .unwrap();
        job.update_status(JobStatus::Running).await.unwrap();

        let run_dir = ws.local_job_dir(job.id());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(
            run_dir.join("stderr.log"),
            "Traceback (most recent call last):\nValueError: bad input\n",
        )
        .unwrap();

        let dispatcher = Dispatcher::new(config);
        dispatcher.poll_running_jobs().await.unwrap();

        assert_eq!(job.status().await.unwrap(), JobStatus::Failed);
        let job_data = job.job_data().await.unwrap();
        assert!(job_data
            .get("error_msg")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .contains("ValueError"));
    }

    #[tokio::test]
    async fn stop_requested_runs_settle_as_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let job = exp.create_job().await.unwrap();
        job.update_job_data_field("provider_name", json!("local"))
            .await
            .unwrap();
        job.update_job_data_field("stop", json!(true)).await.unwrap();
        job.update_status(JobStatus::Running).await.unwrap();
        std::fs::create_dir_all(ws.local_job_dir(job.id())).unwrap();

        let dispatcher = Dispatcher::new(config);
        dispatcher.poll_running_jobs().await.unwrap();
        assert_eq!(job.status().await.unwrap(), JobStatus::Stopped);
    }
}
