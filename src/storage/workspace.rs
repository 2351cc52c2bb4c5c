//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use getset::Getters;
use log::debug;

use crate::config::Configuration;
use crate::consts::*;
use crate::storage::join;
use crate::storage::Storage;
use crate::util::slug::safe_filename;

/// Identity scope a storage root is resolved for.
///
/// Replaces ambient "current organization" state: the caller that knows
/// the identity (HTTP layer, dispatcher) builds one of these and passes
/// it down explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrgContext {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
}

impl OrgContext {
    pub fn anonymous() -> Self {
        OrgContext::default()
    }

    pub fn for_org(org_id: impl Into<String>) -> Self {
        OrgContext {
            org_id: Some(org_id.into()),
            user_id: None,
        }
    }
}

/// An org-scoped workspace root plus the storage handle serving it.
///
/// All state below the root lives on whatever backend the storage URI
/// selects. Per-job venvs, pid files and stdout/stderr under
/// `local_provider_runs/` are deliberately NOT part of this: those always
/// live below the application home on the host-local filesystem.
#[derive(Clone, Debug, Getters)]
pub struct Workspace {
    #[getset(get = "pub")]
    root: String,

    #[getset(get = "pub")]
    storage: Storage,

    #[getset(get = "pub")]
    org: OrgContext,

    #[getset(get = "pub")]
    home: PathBuf,
}

fn home_dir(config: &Configuration) -> PathBuf {
    if let Some(dir) = config.home_dir() {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var(ENV_HOME_DIR) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_HOME_DIR_NAME)
}

fn storage_uri(config: &Configuration) -> Option<String> {
    config
        .storage_uri()
        .clone()
        .or_else(|| std::env::var(ENV_STORAGE_URI).ok())
        .filter(|s| !s.is_empty())
}

impl Workspace {
    /// Resolve the workspace root for an identity scope.
    ///
    /// - cloud storage URI + org: `<proto>://workspace-<org_id>`
    /// - local storage URI + org: `<uri>/orgs/<org_id>/workspace`
    /// - storage URI without org: `<uri>` (cloud) / `<uri>/workspace`
    /// - no storage URI: `$TFL_WORKSPACE_DIR` or `<home>/workspace`,
    ///   org-scoped below `<home>/orgs/<org_id>/workspace`
    pub fn resolve(config: &Configuration, org: OrgContext) -> Result<Workspace> {
        let home = home_dir(config);
        let uri = storage_uri(config);

        let root = match (&uri, &org.org_id) {
            (Some(uri), Some(org_id)) if uri.contains("://") => {
                let proto = uri.split("://").next().unwrap_or("s3");
                format!("{}://workspace-{}", proto, org_id)
            }
            (Some(uri), Some(org_id)) => join(uri, &["orgs", org_id, "workspace"]),
            (Some(uri), None) if uri.contains("://") => uri.clone(),
            (Some(uri), None) => join(uri, &["workspace"]),
            (None, org_id) => {
                if org_id.is_none() {
                    if let Ok(dir) = std::env::var(ENV_WORKSPACE_DIR) {
                        if !dir.is_empty() {
                            if !PathBuf::from(&dir).is_dir() {
                                return Err(anyhow!(
                                    "Workspace directory {} does not exist",
                                    dir
                                ));
                            }
                            let storage = Storage::for_root(&dir)?;
                            return Ok(Workspace {
                                root: dir,
                                storage,
                                org,
                                home,
                            });
                        }
                    }
                }
                let home_str = home.to_string_lossy();
                match org_id {
                    Some(org_id) => join(&home_str, &["orgs", org_id, "workspace"]),
                    None => join(&home_str, &["workspace"]),
                }
            }
        };

        if !root.contains("://") {
            std::fs::create_dir_all(&root)
                .with_context(|| anyhow!("Creating workspace directory {}", root))?;
        }

        debug!("Workspace resolved to {} (org = {:?})", root, org.org_id);
        let storage = Storage::for_root(&root)?;
        Ok(Workspace {
            root,
            storage,
            org,
            home,
        })
    }

    /// The directory containing all org subdirectories, for schedulers
    /// that scan across organizations. None when the storage layout is
    /// cloud-per-org (no single base exists there).
    pub fn orgs_base(config: &Configuration) -> Option<String> {
        match storage_uri(config) {
            Some(uri) if uri.contains("://") => None,
            Some(uri) => Some(join(&uri, &["orgs"])),
            None => Some(join(&home_dir(config).to_string_lossy(), &["orgs"])),
        }
    }

    pub fn experiments_dir(&self) -> String {
        join(&self.root, &[EXPERIMENTS_DIR_NAME])
    }

    pub fn jobs_dir(&self) -> String {
        join(&self.root, &[JOBS_DIR_NAME])
    }

    pub fn datasets_dir(&self) -> String {
        join(&self.root, &[DATASETS_DIR_NAME])
    }

    pub fn models_dir(&self) -> String {
        join(&self.root, &[MODELS_DIR_NAME])
    }

    pub fn tasks_dir(&self) -> String {
        join(&self.root, &[TASKS_DIR_NAME])
    }

    pub fn templates_dir(&self) -> String {
        join(&self.root, &[TEMPLATES_DIR_NAME])
    }

    pub fn plugins_dir(&self) -> String {
        join(&self.root, &[PLUGINS_DIR_NAME])
    }

    pub fn plugin_dir(&self, name: &str) -> String {
        join(&self.root, &[PLUGINS_DIR_NAME, &safe_filename(name)])
    }

    pub fn providers_dir(&self) -> String {
        join(&self.root, &[PROVIDERS_DIR_NAME])
    }

    pub fn workflows_dir(&self) -> String {
        join(&self.root, &[WORKFLOWS_DIR_NAME])
    }

    pub fn workflow_runs_dir(&self) -> String {
        join(&self.root, &[WORKFLOW_RUNS_DIR_NAME])
    }

    pub fn temp_dir(&self) -> String {
        join(&self.root, &[TEMP_DIR_NAME])
    }

    /// Host-local directory for the org's local provider runs.
    /// Always below the application home, never on object storage, so pid
    /// files and process logs stay pollable with any workspace backend.
    pub fn local_runs_dir(&self) -> PathBuf {
        let org_segment = self
            .org
            .org_id
            .as_deref()
            .map(safe_filename)
            .unwrap_or_else(|| "shared".to_string());
        self.home
            .join(LOCAL_PROVIDER_RUNS_DIR_NAME)
            .join("orgs")
            .join(org_segment)
    }

    /// Host-local run directory for one job.
    pub fn local_job_dir(&self, job_id: &str) -> PathBuf {
        self.local_runs_dir().join(safe_filename(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(storage_uri: Option<&str>, home: &std::path::Path) -> Configuration {
        let mut cfg = config::Config::default();
        cfg.set("compatibility", "*").unwrap();
        if let Some(uri) = storage_uri {
            cfg.set("storage_uri", uri).unwrap();
        }
        cfg.set("home_dir", home.to_str().unwrap()).unwrap();
        cfg.try_into::<crate::config::NotValidatedConfiguration>()
            .unwrap()
            .validate()
            .unwrap()
    }

    #[test]
    fn org_scoped_local_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(Some(tmp.path().to_str().unwrap()), tmp.path());
        let ws = Workspace::resolve(&config, OrgContext::for_org("team1")).unwrap();
        assert!(ws.root().ends_with("/orgs/team1/workspace"));
    }

    #[test]
    fn cloud_root_is_per_org_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(Some("s3://lab-root"), tmp.path());
        let ws = Workspace::resolve(&config, OrgContext::for_org("team1")).unwrap();
        assert_eq!(ws.root(), "s3://workspace-team1");
    }

    #[test]
    fn anonymous_root_below_home() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(None, tmp.path());
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();
        assert_eq!(ws.root(), &format!("{}/workspace", tmp.path().display()));
    }

    #[test]
    fn local_runs_stay_below_home() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(Some("s3://lab-root"), tmp.path());
        let ws = Workspace::resolve(&config, OrgContext::for_org("team1")).unwrap();
        let job_dir = ws.local_job_dir("17");
        assert!(job_dir.starts_with(tmp.path()));
        assert!(job_dir
            .to_string_lossy()
            .contains("local_provider_runs/orgs/team1/17"));
    }
}
