//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::trace;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::consts::INDEX_JSON;
use crate::storage::{self, Workspace};
use crate::store::index_worker;
use crate::store::resource::ResourceDir;
use crate::util::slug::safe_filename;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    parse_display::Display,
    parse_display::FromStr,
)]
pub enum JobStatus {
    #[display("NOT_STARTED")]
    #[serde(rename = "NOT_STARTED")]
    NotStarted,
    #[display("QUEUED")]
    #[serde(rename = "QUEUED")]
    Queued,
    #[display("LAUNCHING")]
    #[serde(rename = "LAUNCHING")]
    Launching,
    #[display("RUNNING")]
    #[serde(rename = "RUNNING")]
    Running,
    #[display("COMPLETE")]
    #[serde(rename = "COMPLETE")]
    Complete,
    #[display("FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
    #[display("STOPPED")]
    #[serde(rename = "STOPPED")]
    Stopped,
    #[display("CANCELLED")]
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[display("DELETED")]
    #[serde(rename = "DELETED")]
    Deleted,
}

impl JobStatus {
    /// Statuses that must never be served from the experiment's snapshot
    /// cache because they can change at any moment.
    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            JobStatus::Running | JobStatus::Launching | JobStatus::NotStarted
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete
                | JobStatus::Failed
                | JobStatus::Stopped
                | JobStatus::Cancelled
                | JobStatus::Deleted
        )
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    parse_display::Display,
    parse_display::FromStr,
)]
pub enum JobType {
    #[display("TRAIN")]
    #[serde(rename = "TRAIN")]
    Train,
    #[display("EVAL")]
    #[serde(rename = "EVAL")]
    Eval,
    #[display("GENERATE")]
    #[serde(rename = "GENERATE")]
    Generate,
    #[display("EXPORT")]
    #[serde(rename = "EXPORT")]
    Export,
    #[display("DIFFUSION")]
    #[serde(rename = "DIFFUSION")]
    Diffusion,
    #[display("REMOTE")]
    #[serde(rename = "REMOTE")]
    Remote,
    #[display("TASK")]
    #[serde(rename = "TASK")]
    Task,
    #[display("UNDEFINED")]
    #[serde(rename = "UNDEFINED")]
    Undefined,
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read view over a job's `index.json`.
///
/// Documents on disk are open: ids may be numbers, unknown statuses and
/// stray fields occur. This view normalizes without failing; writers go
/// through the raw document so unknown fields survive untouched.
#[derive(Clone, Debug)]
pub struct JobDocument {
    pub id: String,
    pub experiment_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: i64,
    pub job_data: Map<String, Value>,
    pub raw: Value,
}

impl JobDocument {
    pub fn from_value(value: &Value, fallback_id: &str) -> JobDocument {
        let id = value
            .get("id")
            .and_then(value_to_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback_id.to_string());
        let experiment_id = value
            .get("experiment_id")
            .and_then(value_to_string)
            .unwrap_or_default();
        let job_type = value
            .get("type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(JobType::Undefined);
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(JobStatus::NotStarted);
        let progress = value.get("progress").and_then(Value::as_i64).unwrap_or(0);
        let job_data = value
            .get("job_data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        JobDocument {
            id,
            experiment_id,
            job_type,
            status,
            progress,
            job_data,
            raw: value.clone(),
        }
    }

    pub fn job_data_str(&self, key: &str) -> Option<String> {
        self.job_data.get(key).and_then(value_to_string)
    }

    /// `job_data.config`, decoding a JSON-encoded string if necessary.
    pub fn config(&self) -> Map<String, Value> {
        match self.job_data.get("config") {
            Some(Value::Object(m)) => m.clone(),
            Some(Value::String(s)) => serde_json::from_str::<Value>(s)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            _ => Default::default(),
        }
    }
}

pub struct Job {
    id: String,
    ws: Workspace,
    res: ResourceDir,
}

fn default_document(id: &str) -> Value {
    json!({
        "id": id,
        "experiment_id": "",
        "job_data": { "output_file_path": "" },
        "status": "NOT_STARTED",
        "type": "REMOTE",
        "progress": 0,
        "created_at": chrono::Utc::now().to_rfc3339(),
        "updated_at": chrono::Utc::now().to_rfc3339(),
    })
}

impl Job {
    pub fn job_dir(ws: &Workspace, id: &str) -> String {
        storage::join(&ws.jobs_dir(), &[&safe_filename(id)])
    }

    fn handle(ws: &Workspace, id: &str) -> Job {
        let dir = Self::job_dir(ws, id);
        Job {
            id: id.to_string(),
            ws: ws.clone(),
            res: ResourceDir::new(ws.storage().clone(), dir),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Job> {
        let job = Self::handle(ws, id);
        job.res
            .initialize("Job", id, &default_document(id))
            .await?;
        Ok(job)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Job> {
        let job = Self::handle(ws, id);
        job.res
            .open_existing("Job", id, &default_document(id))
            .await?;
        Ok(job)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &str {
        self.res.dir()
    }

    pub async fn document(&self) -> Result<JobDocument> {
        let value = self.res.json_data().await?;
        Ok(JobDocument::from_value(&value, &self.id))
    }

    pub async fn status(&self) -> Result<JobStatus> {
        Ok(self.document().await?.status)
    }

    pub async fn update_status(&self, status: JobStatus) -> Result<()> {
        trace!("Job {}: status -> {}", self.id, status);
        let mut data = self.res.json_data().await?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("status".to_string(), json!(status.to_string()));
            obj.insert(
                "updated_at".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }
        self.res.set_json_data(&data).await?;
        self.trigger_experiment_rebuild().await;
        Ok(())
    }

    /// Update percent complete. Progress is monotonic within a run, so
    /// values below the recorded one are dropped.
    pub async fn update_progress(&self, progress: i64) -> Result<()> {
        let current = self.document().await?.progress;
        if progress < current {
            trace!(
                "Job {}: ignoring progress {} < {}",
                self.id,
                progress,
                current
            );
            return Ok(());
        }
        self.res.update_field("progress", json!(progress)).await
    }

    pub async fn progress(&self) -> Result<i64> {
        Ok(self.document().await?.progress)
    }

    pub async fn experiment_id(&self) -> Result<String> {
        Ok(self.document().await?.experiment_id)
    }

    pub async fn set_experiment(&self, experiment_id: &str, sync_rebuild: bool) -> Result<()> {
        self.res
            .update_field("experiment_id", json!(experiment_id))
            .await?;
        self.update_job_data_field("experiment_name", json!(experiment_id))
            .await?;

        if sync_rebuild {
            let _ = crate::store::experiment::rebuild_jobs_index(
                self.ws.storage(),
                self.ws.root(),
                experiment_id,
            )
            .await;
        } else {
            index_worker::trigger(experiment_id, self.ws.root());
        }
        Ok(())
    }

    pub async fn set_type(&self, job_type: JobType) -> Result<()> {
        self.res
            .update_field("type", json!(job_type.to_string()))
            .await
    }

    pub async fn job_data(&self) -> Result<Map<String, Value>> {
        Ok(self.document().await?.job_data)
    }

    pub async fn set_job_data(&self, job_data: Map<String, Value>) -> Result<()> {
        self.res
            .update_field("job_data", Value::Object(job_data))
            .await
    }

    pub async fn update_job_data_field(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.res.json_data().await?;
        if !data.is_object() {
            data = Value::Object(Default::default());
        }
        let obj = data
            .as_object_mut()
            .ok_or_else(|| anyhow!("Job document is not an object"))?;
        let job_data = obj
            .entry("job_data".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !job_data.is_object() {
            *job_data = Value::Object(Default::default());
        }
        if let Some(m) = job_data.as_object_mut() {
            m.insert(key.to_string(), value);
        }
        self.res.set_json_data(&data).await
    }

    pub async fn set_error_message(&self, error_msg: &str) -> Result<()> {
        self.update_job_data_field("error_msg", json!(error_msg))
            .await
    }

    pub async fn set_tensorboard_output_dir(&self, dir: &str) -> Result<()> {
        self.update_job_data_field("tensorboard_output_dir", json!(dir))
            .await
    }

    /// The stop flag is cooperative: the API sets it, the running plugin
    /// observes it and exits.
    pub async fn should_stop(&self) -> Result<bool> {
        Ok(self
            .job_data()
            .await?
            .get("stop")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn stop(&self) -> Result<()> {
        self.update_job_data_field("stop", json!(true)).await?;
        self.update_status(JobStatus::Stopped).await
    }

    /// Mark this job deleted. The directory is retained; DELETED excludes
    /// it from listings and from the experiment index.
    pub async fn delete(&self) -> Result<()> {
        self.update_status(JobStatus::Deleted).await
    }

    async fn trigger_experiment_rebuild(&self) {
        if let Ok(experiment_id) = self.experiment_id().await {
            if !experiment_id.is_empty() {
                index_worker::trigger(&experiment_id, self.ws.root());
            }
        }
    }

    /// Resolve the path this job writes its log to.
    ///
    /// The default `<job_dir>/output_<id>.txt` wins once it exists; until
    /// then an override in `job_data.output_file_path` is honored. The
    /// resolved file is created empty if missing so tailers always have
    /// something to open.
    pub async fn log_path(&self) -> Result<String> {
        let mut log_path = storage::join(self.res.dir(), &[&format!("output_{}.txt", self.id)]);

        if !self.ws.storage().exists(&log_path).await? {
            if let Some(override_path) = self.job_data().await?.get("output_file_path") {
                if let Some(p) = override_path.as_str() {
                    if !p.trim().is_empty() {
                        log_path = p.trim().to_string();
                    }
                }
            }
        }

        if !self.ws.storage().exists(&log_path).await? {
            self.ws.storage().write(&log_path, b"").await?;
        }

        Ok(log_path)
    }

    /// Append a message to the job log and mirror it to the process log.
    /// Best-effort: storage failures never fail the caller.
    pub async fn log_info(&self, message: &str) {
        info!("[job {}] {}", self.id, message);

        let result: Result<()> = async {
            let log_path = self.log_path().await?;
            let mut content = self
                .ws
                .storage()
                .read_to_string(&log_path)
                .await
                .unwrap_or_default();
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(message);
            if !content.ends_with('\n') {
                content.push('\n');
            }
            self.ws.storage().write(&log_path, content.as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            trace!("Dropped log line for job {}: {}", self.id, e);
        }
    }

    async fn subdir(&self, name: &str) -> Result<String> {
        let dir = storage::join(self.res.dir(), &[name]);
        self.ws.storage().makedirs(&dir).await?;
        Ok(dir)
    }

    pub async fn artifacts_dir(&self) -> Result<String> {
        self.subdir("artifacts").await
    }

    pub async fn checkpoints_dir(&self) -> Result<String> {
        self.subdir("checkpoints").await
    }

    pub async fn models_dir(&self) -> Result<String> {
        self.subdir("models").await
    }

    pub async fn datasets_dir(&self) -> Result<String> {
        self.subdir("datasets").await
    }

    pub async fn eval_results_dir(&self) -> Result<String> {
        self.subdir("eval_results").await
    }

    /// All files in the artifacts directory, sorted.
    pub async fn artifact_paths(&self) -> Result<Vec<String>> {
        let dir = storage::join(self.res.dir(), &["artifacts"]);
        if !self.ws.storage().exists(&dir).await? {
            return Ok(vec![]);
        }
        let mut files = Vec::new();
        for entry in self.ws.storage().ls(&dir).await? {
            if self.ws.storage().isfile(&entry).await? {
                files.push(entry);
            }
        }
        files.sort();
        Ok(files)
    }

    /// All entries (files and directories) in the checkpoints directory.
    pub async fn checkpoint_paths(&self) -> Result<Vec<String>> {
        let dir = storage::join(self.res.dir(), &["checkpoints"]);
        if !self.ws.storage().exists(&dir).await? {
            return Ok(vec![]);
        }
        let mut entries = self.ws.storage().ls(&dir).await?;
        entries.sort();
        Ok(entries)
    }

    /// Count jobs currently RUNNING in this workspace.
    pub async fn count_running(ws: &Workspace) -> Result<usize> {
        let mut count = 0;
        for doc in Self::scan(ws).await? {
            if doc.status == JobStatus::Running {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The oldest QUEUED job in this workspace, ordered by numeric id.
    pub async fn next_queued(ws: &Workspace) -> Result<Option<JobDocument>> {
        let mut queued: Vec<(u64, JobDocument)> = Self::scan(ws)
            .await?
            .into_iter()
            .filter(|doc| doc.status == JobStatus::Queued)
            .map(|doc| (doc.id.parse::<u64>().unwrap_or(0), doc))
            .collect();
        queued.sort_by_key(|(n, _)| *n);
        Ok(queued.into_iter().next().map(|(_, doc)| doc))
    }

    /// Read every job document below the workspace jobs directory.
    /// Unreadable entries are skipped.
    pub async fn scan(ws: &Workspace) -> Result<Vec<JobDocument>> {
        let jobs_dir = ws.jobs_dir();
        let mut docs = Vec::new();
        let entries = ws.storage().ls(&jobs_dir).await.unwrap_or_default();
        for entry in entries {
            let name = storage::file_name(&entry);
            if name.is_empty() || name.starts_with("._") {
                continue;
            }
            if !ws.storage().isdir(&entry).await.unwrap_or(false) {
                continue;
            }
            let index_file = storage::join(&entry, &[INDEX_JSON]);
            let content = match ws.storage().read_to_string(&index_file).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let value: Value = match serde_json::from_str(content.trim()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            docs.push(JobDocument::from_value(&value, name));
        }
        Ok(docs)
    }

    /// Allocate the next job id: largest numeric job directory plus one.
    pub async fn allocate_id(ws: &Workspace) -> Result<String> {
        let jobs_dir = ws.jobs_dir();
        ws.storage()
            .makedirs(&jobs_dir)
            .await
            .with_context(|| anyhow!("Creating jobs directory {}", jobs_dir))?;

        let mut largest = 0u64;
        for entry in ws.storage().ls(&jobs_dir).await? {
            let name = storage::file_name(&entry);
            if let Ok(n) = name.parse::<u64>() {
                if ws.storage().isdir(&entry).await.unwrap_or(false) && n > largest {
                    largest = n;
                }
            }
        }
        Ok((largest + 1).to_string())
    }
}
