//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Experiments and their per-experiment job index.
//!
//! Each experiment owns a `jobs.json` next to its `index.json`:
//!
//! ```json
//! { "index": { "<TYPE>": ["<job_id>", ...] },
//!   "cached_jobs": { "<job_id>": { ...full job document... } } }
//! ```
//!
//! `index` lists every job belonging to the experiment except DELETED
//! ones. `cached_jobs` snapshots settled jobs so listings avoid reading
//! hundreds of individual documents; jobs in a volatile status (RUNNING,
//! LAUNCHING, NOT_STARTED) are never served from the snapshot.

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;
use log::warn;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::consts::INDEX_JSON;
use crate::consts::JOBS_JSON;
use crate::storage::{self, Storage, Workspace};
use crate::store::index_worker;
use crate::store::job::{Job, JobDocument, JobStatus, JobType};
use crate::store::resource::ResourceDir;
use crate::util::slug::safe_filename;

pub struct Experiment {
    id: String,
    ws: Workspace,
    res: ResourceDir,
}

fn default_document(id: &str) -> Value {
    json!({ "id": id, "name": id, "config": {} })
}

impl Experiment {
    pub fn experiment_dir(ws: &Workspace, id: &str) -> String {
        storage::join(&ws.experiments_dir(), &[&safe_filename(id)])
    }

    fn handle(ws: &Workspace, id: &str) -> Experiment {
        let dir = Self::experiment_dir(ws, id);
        Experiment {
            id: id.to_string(),
            ws: ws.clone(),
            res: ResourceDir::new(ws.storage().clone(), dir),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Experiment> {
        let exp = Self::handle(ws, id);
        exp.res
            .initialize("Experiment", id, &default_document(id))
            .await?;
        Ok(exp)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Experiment> {
        let exp = Self::handle(ws, id);
        exp.res
            .open_existing("Experiment", id, &default_document(id))
            .await?;
        Ok(exp)
    }

    /// Experiments are created on first use.
    pub async fn create_or_get(ws: &Workspace, id: &str) -> Result<Experiment> {
        let exp = Self::handle(ws, id);
        if exp.ws.storage().isdir(exp.res.dir()).await? {
            exp.res
                .open_existing("Experiment", id, &default_document(id))
                .await?;
        } else {
            exp.res
                .initialize("Experiment", id, &default_document(id))
                .await?;
        }
        Ok(exp)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &str {
        self.res.dir()
    }

    pub async fn document(&self) -> Result<Value> {
        self.res.json_data().await
    }

    pub async fn config(&self) -> Result<Map<String, Value>> {
        Ok(self
            .res
            .get_field("config")
            .await?
            .as_object()
            .cloned()
            .unwrap_or_default())
    }

    pub async fn update_config_field(&self, key: &str, value: Value) -> Result<()> {
        let mut config = self.config().await?;
        config.insert(key.to_string(), value);
        self.res.update_field("config", Value::Object(config)).await
    }

    /// List all experiment documents in the workspace.
    pub async fn get_all(ws: &Workspace) -> Result<Vec<Value>> {
        let mut experiments = Vec::new();
        for entry in ws
            .storage()
            .ls(&ws.experiments_dir())
            .await
            .unwrap_or_default()
        {
            if !ws.storage().isdir(&entry).await.unwrap_or(false) {
                continue;
            }
            let index_file = storage::join(&entry, &[INDEX_JSON]);
            if let Ok(content) = ws.storage().read_to_string(&index_file).await {
                if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
                    experiments.push(value);
                }
            }
        }
        Ok(experiments)
    }

    /// Create a new job owned by this experiment, with the next free
    /// numeric id.
    pub async fn create_job(&self) -> Result<Job> {
        let job_id = Job::allocate_id(&self.ws).await?;
        let job = Job::create(&self.ws, &job_id).await?;
        job.set_experiment(&self.id, false).await?;
        Ok(job)
    }

    pub fn jobs_json_file(&self) -> String {
        storage::join(self.res.dir(), &[JOBS_JSON])
    }

    async fn read_jobs_file(
        &self,
    ) -> Result<Option<(BTreeMap<String, Vec<String>>, Map<String, Value>)>> {
        let content = match self
            .ws
            .storage()
            .read_to_string(&self.jobs_json_file())
            .await
        {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        let value: Value = match serde_json::from_str(content.trim()) {
            Ok(v) => v,
            Err(e) => {
                warn!("Unparseable jobs.json for experiment {}: {}", self.id, e);
                return Ok(None);
            }
        };

        // Old layout carried the type map at the top level
        let (index_value, cached) = match value.get("index") {
            Some(index) => (
                index.clone(),
                value
                    .get("cached_jobs")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            ),
            None => (value, Default::default()),
        };

        let mut index = BTreeMap::new();
        if let Some(map) = index_value.as_object() {
            for (job_type, ids) in map {
                let ids = ids
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| match v {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                index.insert(job_type.clone(), ids);
            }
        }
        Ok(Some((index, cached)))
    }

    /// List jobs of this experiment, following the snapshot cache
    /// protocol: settled jobs come from `cached_jobs`, volatile ones are
    /// read live, and observed staleness schedules a rebuild.
    ///
    /// A `status` filter is matched exactly; without one, DELETED jobs
    /// are excluded.
    pub async fn get_jobs(
        &self,
        job_type: Option<JobType>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobDocument>> {
        let (index, mut cached) = match self.read_jobs_file().await? {
            Some(data) => data,
            None => {
                rebuild_jobs_index(self.ws.storage(), self.ws.root(), &self.id).await?;
                self.read_jobs_file().await?.unwrap_or_default()
            }
        };

        let ids: Vec<String> = match job_type {
            Some(t) => index.get(&t.to_string()).cloned().unwrap_or_default(),
            None => index.values().flatten().cloned().collect(),
        };

        let mut results = Vec::new();
        for job_id in ids {
            let doc = match cached.remove(&job_id) {
                Some(cached_value) => {
                    let cached_doc = JobDocument::from_value(&cached_value, &job_id);
                    if cached_doc.status.is_volatile() {
                        // Stale snapshot: read live and drop the entry.
                        // A rebuild is only needed when the status moved.
                        match self.read_live(&job_id).await {
                            Some(live) => {
                                if live.status != cached_doc.status {
                                    self.trigger_cache_rebuild(false).await;
                                }
                                live
                            }
                            None => continue,
                        }
                    } else {
                        cached_doc
                    }
                }
                None => match self.read_live(&job_id).await {
                    Some(live) => {
                        if matches!(
                            live.status,
                            JobStatus::Complete | JobStatus::Stopped | JobStatus::Failed
                        ) {
                            // Settled but not yet snapshotted
                            self.trigger_cache_rebuild(false).await;
                        }
                        live
                    }
                    None => continue,
                },
            };

            if let Some(wanted) = status {
                if doc.status != wanted {
                    continue;
                }
            } else if doc.status == JobStatus::Deleted {
                continue;
            }

            if doc.raw.get("job_data").is_none() {
                continue;
            }

            results.push(doc);
        }

        Ok(results)
    }

    async fn read_live(&self, job_id: &str) -> Option<JobDocument> {
        let job = Job::get(&self.ws, job_id).await.ok()?;
        job.document().await.ok()
    }

    /// Register a job id under a type in `jobs.json` without a full
    /// rebuild, then schedule one to refresh the snapshots.
    pub async fn add_job(&self, job_id: &str, job_type: JobType) -> Result<()> {
        let (mut index, cached) = self.read_jobs_file().await?.unwrap_or_default();
        index
            .entry(job_type.to_string())
            .or_default()
            .push(job_id.to_string());

        self.write_jobs_file(&index, &cached).await?;
        self.trigger_cache_rebuild(false).await;
        Ok(())
    }

    async fn write_jobs_file(
        &self,
        index: &BTreeMap<String, Vec<String>>,
        cached: &Map<String, Value>,
    ) -> Result<()> {
        let document = json!({ "index": index, "cached_jobs": cached });
        self.ws
            .storage()
            .write(
                &self.jobs_json_file(),
                serde_json::to_string_pretty(&document)?.as_bytes(),
            )
            .await
    }

    /// Schedule (or, with `sync`, perform) a rebuild of this experiment's
    /// `jobs.json`.
    pub async fn trigger_cache_rebuild(&self, sync: bool) {
        if sync {
            if let Err(e) =
                rebuild_jobs_index(self.ws.storage(), self.ws.root(), &self.id).await
            {
                warn!("Synchronous index rebuild failed for {}: {}", self.id, e);
            }
        } else {
            index_worker::trigger(&self.id, self.ws.root());
        }
    }

    /// Destroy this experiment: all owned jobs become DELETED, then the
    /// experiment directory is removed.
    pub async fn delete(self) -> Result<()> {
        self.delete_all_jobs().await?;
        self.res.delete().await
    }

    pub async fn delete_all_jobs(&self) -> Result<()> {
        let (index, _) = self.read_jobs_file().await?.unwrap_or_default();
        for job_id in index.values().flatten() {
            if let Ok(job) = Job::get(&self.ws, job_id).await {
                job.delete().await?;
            }
        }
        Ok(())
    }
}

/// Rebuild an experiment's `jobs.json` from the job directories.
///
/// Runs against a bare storage root so the background worker can execute
/// it without holding experiment or job handles. Non-numeric entries and
/// macOS `._*` droppings are skipped, as are documents that are empty,
/// unparseable, foreign to this experiment or DELETED. Snapshots are
/// taken for every job not in a volatile status.
pub async fn rebuild_jobs_index(
    storage: &Storage,
    workspace_root: &str,
    experiment_id: &str,
) -> Result<()> {
    let jobs_dir = storage::join(workspace_root, &[crate::consts::JOBS_DIR_NAME]);
    let mut entries: Vec<(u64, String)> = storage
        .ls(&jobs_dir)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|path| {
            let name = storage::file_name(&path).to_string();
            if name.is_empty() || name.starts_with("._") {
                return None;
            }
            name.parse::<u64>().ok().map(|n| (n, path))
        })
        .collect();
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut cached_jobs: Map<String, Value> = Default::default();

    for (_, entry_path) in entries {
        if !storage.isdir(&entry_path).await.unwrap_or(false) {
            continue;
        }
        let name = storage::file_name(&entry_path).to_string();
        let index_file = storage::join(&entry_path, &[INDEX_JSON]);
        let content = match storage.read_to_string(&index_file).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(content) {
            Ok(v) => v,
            Err(e) => {
                debug!("Skipping unparseable job document {}: {}", index_file, e);
                continue;
            }
        };

        let doc = JobDocument::from_value(&value, &name);
        if doc.experiment_id != experiment_id {
            continue;
        }
        if doc.status == JobStatus::Deleted {
            continue;
        }

        index
            .entry(doc.job_type.to_string())
            .or_default()
            .push(name.clone());

        if !doc.status.is_volatile() {
            cached_jobs.insert(name, value);
        }
    }

    if index.is_empty() {
        return Ok(());
    }

    let jobs_json = storage::join(
        workspace_root,
        &[
            crate::consts::EXPERIMENTS_DIR_NAME,
            &safe_filename(experiment_id),
            JOBS_JSON,
        ],
    );
    let document = json!({ "index": index, "cached_jobs": cached_jobs });
    storage
        .write(&jobs_json, serde_json::to_string_pretty(&document)?.as_bytes())
        .await
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

    async fn make_job(ws: &Workspace, exp: &Experiment, status: JobStatus) -> String {
        let job = exp.create_job().await.unwrap();
        job.update_status(status).await.unwrap();
        job.id().to_string()
    }

    #[tokio::test]
    async fn create_job_allocates_increasing_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let first = exp.create_job().await.unwrap();
        let second = exp.create_job().await.unwrap();
        assert_eq!(first.id(), "1");
        assert_eq!(second.id(), "2");
        assert_eq!(first.experiment_id().await.unwrap(), "alpha");
    }

    #[tokio::test]
    async fn rebuild_groups_by_type_and_skips_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let complete = make_job(&ws, &exp, JobStatus::Complete).await;
        let deleted = make_job(&ws, &exp, JobStatus::Deleted).await;
        let running = make_job(&ws, &exp, JobStatus::Running).await;

        rebuild_jobs_index(ws.storage(), ws.root(), "alpha")
            .await
            .unwrap();

        let (index, cached) = exp.read_jobs_file().await.unwrap().unwrap();
        let all_ids: Vec<&String> = index.values().flatten().collect();
        assert!(all_ids.contains(&&complete));
        assert!(all_ids.contains(&&running));
        assert!(!all_ids.contains(&&deleted));

        // volatile jobs are never snapshotted
        assert!(cached.contains_key(&complete));
        assert!(!cached.contains_key(&running));
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();
        make_job(&ws, &exp, JobStatus::Complete).await;

        rebuild_jobs_index(ws.storage(), ws.root(), "alpha")
            .await
            .unwrap();
        let first = ws
            .storage()
            .read_to_string(&exp.jobs_json_file())
            .await
            .unwrap();

        rebuild_jobs_index(ws.storage(), ws.root(), "alpha")
            .await
            .unwrap();
        let second = ws
            .storage()
            .read_to_string(&exp.jobs_json_file())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stale_cache_entries_self_heal() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let job_id = make_job(&ws, &exp, JobStatus::Running).await;

        // A snapshot taken while the job was RUNNING (possible with an
        // old on-disk layout): the live document has moved on
        let mut index = BTreeMap::new();
        index.insert("UNDEFINED".to_string(), vec![job_id.clone()]);
        let mut cached: Map<String, Value> = Default::default();
        cached.insert(
            job_id.clone(),
            json!({"id": job_id, "experiment_id": "alpha", "type": "UNDEFINED",
                   "status": "RUNNING", "progress": 0, "job_data": {}}),
        );
        exp.write_jobs_file(&index, &cached).await.unwrap();

        let job = Job::get(&ws, &job_id).await.unwrap();
        job.update_status(JobStatus::Complete).await.unwrap();

        // Listing must serve the live status, not the snapshot
        let jobs = exp.get_jobs(None, None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Complete);

        // After a rebuild the snapshot has caught up
        exp.trigger_cache_rebuild(true).await;
        let (_, cached) = exp.read_jobs_file().await.unwrap().unwrap();
        let snapshot = cached.get(&job_id).unwrap();
        assert_eq!(
            snapshot.get("status").and_then(Value::as_str),
            Some("COMPLETE")
        );
    }

    #[tokio::test]
    async fn status_filter_and_deleted_exclusion() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();

        let complete = make_job(&ws, &exp, JobStatus::Complete).await;
        let deleted = make_job(&ws, &exp, JobStatus::Deleted).await;
        exp.trigger_cache_rebuild(true).await;

        let default_listing = exp.get_jobs(None, None).await.unwrap();
        assert!(default_listing.iter().any(|d| d.id == complete));
        assert!(!default_listing.iter().any(|d| d.id == deleted));

        let complete_only = exp
            .get_jobs(None, Some(JobStatus::Complete))
            .await
            .unwrap();
        assert_eq!(complete_only.len(), 1);
    }

    #[tokio::test]
    async fn missing_jobs_json_is_rebuilt_on_first_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();
        let job_id = make_job(&ws, &exp, JobStatus::Complete).await;

        // wipe the index; the listing has to recover by scanning
        ws.storage().rm(&exp.jobs_json_file()).await.unwrap();
        let jobs = exp.get_jobs(None, None).await.unwrap();
        assert!(jobs.iter().any(|d| d.id == job_id));
    }

    #[tokio::test]
    async fn delete_experiment_deletes_owned_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let exp = Experiment::create(&ws, "alpha").await.unwrap();
        let job_id = make_job(&ws, &exp, JobStatus::Complete).await;
        exp.trigger_cache_rebuild(true).await;

        exp.delete().await.unwrap();

        let job = Job::get(&ws, &job_id).await.unwrap();
        assert_eq!(job.status().await.unwrap(), JobStatus::Deleted);
        assert!(!ws
            .storage()
            .isdir(&Experiment::experiment_dir(&ws, "alpha"))
            .await
            .unwrap());
    }
}
