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
use getset::{CopyGetters, Getters};
use serde::Deserialize;

use crate::config::util::*;
use crate::config::Configuration;

#[derive(Debug, Getters, CopyGetters, Deserialize)]
pub struct NotValidatedConfiguration {
    #[serde(default = "default_compatibility")]
    #[getset(get = "pub")]
    compatibility: semver::VersionReq,

    /// Workspace storage root: a local path, `s3://...`, `gs://...` or
    /// `abfs://...` URI. Overrides the `TFL_STORAGE_URI` environment.
    #[getset(get = "pub")]
    storage_uri: Option<String>,

    /// Application home. Defaults to `~/.transformerlab` at resolution time.
    #[getset(get = "pub")]
    home_dir: Option<PathBuf>,

    /// Directory holding the base project (`pyproject.toml`) used by the
    /// local provider when syncing per-job environments.
    #[getset(get = "pub")]
    source_code_dir: Option<PathBuf>,

    /// Optional YAML file listing compute providers keyed by name. The
    /// router falls back to this when a provider is not in the store.
    #[getset(get = "pub")]
    providers_file: Option<PathBuf>,

    /// JSON file mapping secret names to values. Stands in for the team
    /// secret store; secrets are injected into plugin subprocesses only.
    #[getset(get = "pub")]
    secrets_file: Option<PathBuf>,

    #[serde(default = "default_progress_format")]
    #[getset(get = "pub")]
    progress_format: String,

    #[serde(default = "default_spinner_format")]
    #[getset(get = "pub")]
    spinner_format: String,

    /// Seconds between dispatcher queue drains in `kiln serve`
    #[serde(default = "default_dispatch_interval")]
    #[getset(get_copy = "pub")]
    dispatch_interval: u64,

    /// Milliseconds between polls when following a job log
    #[serde(default = "default_log_poll_millis")]
    #[getset(get_copy = "pub")]
    log_poll_millis: u64,

    /// Number of stderr lines recorded as `error_msg` when a launch fails
    #[serde(default = "default_error_log_lines")]
    #[getset(get_copy = "pub")]
    error_log_lines: usize,
}

impl NotValidatedConfiguration {
    pub fn validate(self) -> Result<Configuration> {
        let crate_version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
            .context("Parsing version of crate (CARGO_PKG_VERSION) into semver::Version object")?;

        if !self.compatibility.matches(&crate_version) {
            return Err(anyhow!(
                "Configuration is not compatible to kiln {}",
                crate_version
            ));
        }

        if let Some(dir) = self.source_code_dir.as_ref() {
            if !dir.is_dir() {
                return Err(anyhow!(
                    "Not a directory: source_code_dir = {}",
                    dir.display()
                ));
            }
        }

        if let Some(file) = self.providers_file.as_ref() {
            if !file.is_file() {
                return Err(anyhow!(
                    "Providers file is not a file: {}",
                    file.display()
                ));
            }
        }

        if let Some(file) = self.secrets_file.as_ref() {
            if !file.is_file() {
                return Err(anyhow!("Secrets file is not a file: {}", file.display()));
            }
        }

        Ok(Configuration { inner: self })
    }
}
