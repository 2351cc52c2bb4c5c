//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

/// Directory name for per-experiment state below the workspace root
pub const EXPERIMENTS_DIR_NAME: &str = "experiments";

/// Directory name for per-job state below the workspace root
pub const JOBS_DIR_NAME: &str = "jobs";

pub const DATASETS_DIR_NAME: &str = "datasets";
pub const MODELS_DIR_NAME: &str = "models";
pub const TASKS_DIR_NAME: &str = "tasks";
pub const TEMPLATES_DIR_NAME: &str = "templates";
pub const PLUGINS_DIR_NAME: &str = "plugins";
pub const PROVIDERS_DIR_NAME: &str = "providers";
pub const WORKFLOWS_DIR_NAME: &str = "workflows";
pub const WORKFLOW_RUNS_DIR_NAME: &str = "workflow_runs";
pub const TEMP_DIR_NAME: &str = "temp";

/// The metadata document every resource directory carries
pub const INDEX_JSON: &str = "index.json";

/// The per-experiment job index / snapshot cache document
pub const JOBS_JSON: &str = "jobs.json";

/// Companion document written next to models registered from a job
pub const PROVENANCE_JSON: &str = "_tlab_provenance.json";

/// Default application home when no workspace override is configured
pub const DEFAULT_HOME_DIR_NAME: &str = ".transformerlab";

/// Directory below the application home holding per-job venvs, pid files
/// and stdout/stderr logs. Always on the host-local filesystem.
pub const LOCAL_PROVIDER_RUNS_DIR_NAME: &str = "local_provider_runs";

/// Environment variables honored for workspace resolution
pub const ENV_WORKSPACE_DIR: &str = "TFL_WORKSPACE_DIR";
pub const ENV_STORAGE_URI: &str = "TFL_STORAGE_URI";
pub const ENV_HOME_DIR: &str = "TFL_HOME_DIR";

/// Environment variables injected into every plugin subprocess
pub const ENV_JOB_ID: &str = "_TFL_JOB_ID";
pub const ENV_EXPERIMENT_ID: &str = "_TFL_EXPERIMENT_ID";
pub const ENV_ORG_ID: &str = "_TFL_ORG_ID";
pub const ENV_USER_ID: &str = "_TFL_USER_ID";

/// Where the base project (pyproject.toml) lives; consumed by the local
/// provider when syncing a per-job venv
pub const ENV_SOURCE_CODE_DIR: &str = "_TFL_SOURCE_CODE_DIR";

/// Timeout for `uv venv` when materializing a per-job environment
pub const VENV_CREATE_TIMEOUT_SECS: u64 = 120;

/// Timeout for syncing the base project into a per-job venv
pub const VENV_SYNC_TIMEOUT_SECS: u64 = 600;

/// Timeout for the plugin setup phase
pub const PLUGIN_SETUP_TIMEOUT_SECS: u64 = 300;

/// Control-plane HTTP timeout for provider calls
pub const PROVIDER_HTTP_TIMEOUT_SECS: u64 = 30;

/// Short timeout for provider liveness checks
pub const PROVIDER_CHECK_TIMEOUT_SECS: u64 = 5;
