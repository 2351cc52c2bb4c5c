//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The local compute provider: runs each launch inside a fresh uv venv
//! synced with the base environment, as a detached subprocess on this
//! machine.
//!
//! Pid files, stdout/stderr and venvs live in the per-job run directory
//! handed over via `provider_config.workspace_dir`. That directory is
//! always on the host-local filesystem, so status polling keeps working
//! when the workspace itself is on object storage.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use log::trace;

use crate::consts::ENV_SOURCE_CODE_DIR;
use crate::consts::PLUGIN_SETUP_TIMEOUT_SECS;
use crate::consts::VENV_CREATE_TIMEOUT_SECS;
use crate::consts::VENV_SYNC_TIMEOUT_SECS;
use crate::provider::error::{ProviderError, ProviderResult};
use crate::provider::models::*;
use crate::provider::ComputeProvider;
use crate::provider::LogOutput;

/// True if an NVIDIA GPU answers `nvidia-smi`.
fn check_nvidia_gpu() -> bool {
    if which::which("nvidia-smi").is_err() {
        return false;
    }
    run_with_timeout(
        Command::new("nvidia-smi").args(["--query-gpu=name", "--format=csv,noheader,nounits"]),
        Duration::from_secs(10),
    )
    .map(|out| out.success && !out.stdout.trim().is_empty())
    .unwrap_or(false)
}

/// True if an AMD GPU answers `rocminfo`.
fn check_amd_gpu() -> bool {
    if which::which("rocminfo").is_err() {
        return false;
    }
    run_with_timeout(&mut Command::new("rocminfo"), Duration::from_secs(10))
        .map(|out| out.success)
        .unwrap_or(false)
}

/// NVIDIA DGX Spark machines need the cu130 PyTorch wheel index.
fn is_dgx_spark() -> bool {
    std::fs::read_to_string("/etc/dgx-release")
        .map(|content| content.to_lowercase().contains("dgx spark"))
        .unwrap_or(false)
}

/// The pyproject extras tag for this platform, probed in order:
/// NVIDIA, AMD ROCm, CPU.
fn pyproject_extra() -> &'static str {
    if check_nvidia_gpu() {
        "[nvidia]"
    } else if check_amd_gpu() {
        "[rocm]"
    } else {
        "[cpu]"
    }
}

/// Extra `uv pip install` flags selecting the matching PyTorch wheel
/// index. Apple machines use the default index; plain NVIDIA (cu128)
/// needs no override either.
fn uv_pip_install_flags() -> &'static str {
    if check_amd_gpu() {
        "--index https://download.pytorch.org/whl/rocm6.4 --index-strategy unsafe-best-match"
    } else if check_nvidia_gpu() {
        if is_dgx_spark() {
            "--index https://download.pytorch.org/whl/cu130 --index-strategy unsafe-best-match"
        } else {
            ""
        }
    } else if cfg!(target_os = "macos") {
        ""
    } else {
        "--index https://download.pytorch.org/whl/cpu --index-strategy unsafe-best-match"
    }
}

struct CommandOutcome {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Run a command to completion with a deadline. Output is captured via
/// pipes drained on reader threads so a chatty child cannot deadlock on
/// a full pipe.
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> anyhow::Result<CommandOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("Spawning subprocess")?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().context("Waiting for subprocess")? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(anyhow!(
                        "Subprocess exceeded timeout of {} seconds",
                        timeout.as_secs()
                    ));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(CommandOutcome {
        success: status.success(),
        code: status.code(),
        stdout,
        stderr,
    })
}

fn read_all<R: std::io::Read>(reader: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_string(&mut buf);
    }
    buf
}

fn first_nonempty(a: &str, b: &str) -> String {
    if !a.trim().is_empty() {
        a.trim().to_string()
    } else if !b.trim().is_empty() {
        b.trim().to_string()
    } else {
        "unknown error".to_string()
    }
}

/// Runs each "cluster" (one launch) in a dedicated venv synced with the
/// base environment. Resource fields of `ClusterConfig` are ignored;
/// runs use the local machine. Launch serialization is the dispatcher's
/// job.
#[derive(Debug)]
pub struct LocalProvider {
    /// Run directory for status/stop/log operations on an already
    /// launched run. `launch_cluster` takes its directory from the
    /// cluster config instead.
    run_dir: Option<PathBuf>,
}

impl LocalProvider {
    pub fn new() -> LocalProvider {
        LocalProvider { run_dir: None }
    }

    /// A handle scoped to one run directory, for polling and stopping a
    /// launch that already happened.
    pub fn for_run(run_dir: PathBuf) -> LocalProvider {
        LocalProvider {
            run_dir: Some(run_dir),
        }
    }

    fn require_run_dir(&self) -> ProviderResult<&Path> {
        self.run_dir
            .as_deref()
            .ok_or_else(|| ProviderError::Launch("workspace_dir (run directory) not set".into()))
    }

    fn read_pid(dir: &Path) -> Option<i32> {
        std::fs::read_to_string(dir.join("pid"))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
    }

    fn pid_alive(pid: i32) -> bool {
        // Signal 0 probes for existence without delivering anything
        send_signal(pid, 0)
    }

    /// Create the venv and sync it with the base project named by
    /// `_TFL_SOURCE_CODE_DIR`.
    fn ensure_venv_and_sync(&self, venv_path: &Path) -> ProviderResult<()> {
        let source_code_dir = std::env::var(ENV_SOURCE_CODE_DIR)
            .ok()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                ProviderError::Launch(format!(
                    "{} is not set; cannot sync base environment",
                    ENV_SOURCE_CODE_DIR
                ))
            })?;
        if !Path::new(&source_code_dir).is_dir() {
            return Err(ProviderError::Launch(format!(
                "{} is not a directory; cannot sync base environment",
                source_code_dir
            )));
        }
        let pyproject = Path::new(&source_code_dir).join("pyproject.toml");
        if !pyproject.exists() {
            return Err(ProviderError::Launch(format!(
                "pyproject.toml not found at {}",
                pyproject.display()
            )));
        }

        std::fs::create_dir_all(venv_path)
            .with_context(|| anyhow!("Creating venv directory {}", venv_path.display()))?;

        // Match the plugin install default: uv venv --python 3.11
        let parent = venv_path.parent().unwrap_or(Path::new("."));
        let outcome = run_with_timeout(
            Command::new("uv")
                .arg("venv")
                .arg(venv_path)
                .args(["--python", "3.11", "--clear"])
                .current_dir(parent),
            Duration::from_secs(VENV_CREATE_TIMEOUT_SECS),
        )
        .map_err(|e| ProviderError::Launch(format!("uv venv failed: {}", e)))?;
        if !outcome.success {
            return Err(ProviderError::Launch(format!(
                "uv venv failed: {}",
                first_nonempty(&outcome.stderr, &outcome.stdout)
            )));
        }

        let extra = pyproject_extra();
        let flags = uv_pip_install_flags();
        let activate = venv_path.join("bin").join("activate");
        let sync_cmd = format!(
            "source {} && cd {} && uv pip install {} .{}",
            crate::util::shell::quote(&activate.to_string_lossy()),
            crate::util::shell::quote(&source_code_dir),
            flags,
            extra,
        );
        trace!("Syncing venv: {}", sync_cmd);

        let outcome = run_with_timeout(
            Command::new("/bin/bash")
                .args(["-c", &sync_cmd])
                .current_dir(parent),
            Duration::from_secs(VENV_SYNC_TIMEOUT_SECS),
        )
        .map_err(|e| ProviderError::Launch(format!("uv pip install failed: {}", e)))?;
        if !outcome.success {
            return Err(ProviderError::Launch(format!(
                "uv pip install failed: {}",
                first_nonempty(&outcome.stderr, &outcome.stdout)
            )));
        }

        Ok(())
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        LocalProvider::new()
    }
}

impl ComputeProvider for LocalProvider {
    /// Materialize the per-job venv, run the setup phase, then start the
    /// command as a detached subprocess with pid and log files in the
    /// run directory.
    fn launch_cluster(
        &self,
        cluster_name: &str,
        config: &ClusterConfig,
    ) -> ProviderResult<LaunchOutcome> {
        let job_dir = config
            .provider_config
            .workspace_dir
            .as_deref()
            .filter(|d| d.is_dir())
            .ok_or_else(|| {
                ProviderError::Launch(
                    "Local provider requires workspace_dir (job directory) in provider_config"
                        .into(),
                )
            })?;

        debug!(
            "Local launch {} in {}",
            cluster_name,
            job_dir.display()
        );

        let venv_path = job_dir.join("venv");
        self.ensure_venv_and_sync(&venv_path)?;

        let venv_bin = venv_path.join("bin");
        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (k, v) in &config.env_vars {
            env.insert(k.clone(), v.clone());
        }
        let path_value = format!(
            "{}:{}",
            venv_bin.display(),
            env.get("PATH").cloned().unwrap_or_default()
        );
        env.insert("PATH".to_string(), path_value);

        if let Some(setup) = config.setup.as_deref().filter(|s| !s.trim().is_empty()) {
            debug!("Local launch {}: running setup", cluster_name);
            let mut cmd = Command::new("/bin/bash");
            cmd.args(["-c", setup]).current_dir(job_dir).env_clear().envs(&env);
            let outcome = run_with_timeout(&mut cmd, Duration::from_secs(PLUGIN_SETUP_TIMEOUT_SECS))
                .map_err(|e| ProviderError::Launch(format!("Setup failed: {}", e)))?;
            if !outcome.success {
                return Err(ProviderError::Launch(format!(
                    "Setup failed with code {:?}: {}",
                    outcome.code,
                    first_nonempty(&outcome.stderr, &outcome.stdout)
                )));
            }
        }

        let command = config.command.as_deref().unwrap_or("true");
        debug!("Local launch {}: running command: {}", cluster_name, command);

        let stdout_file = std::fs::File::create(job_dir.join("stdout.log"))
            .with_context(|| anyhow!("Creating stdout.log in {}", job_dir.display()))?;
        let stderr_file = std::fs::File::create(job_dir.join("stderr.log"))
            .with_context(|| anyhow!("Creating stderr.log in {}", job_dir.display()))?;

        let mut cmd = Command::new("/bin/bash");
        cmd.args(["-c", command])
            .current_dir(job_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file);
        // Own process group: the run outlives and ignores the API process
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let child = cmd
            .spawn()
            .with_context(|| anyhow!("Spawning run command for {}", cluster_name))?;
        let pid = child.id();

        std::fs::write(job_dir.join("pid"), pid.to_string())
            .with_context(|| anyhow!("Writing pid file in {}", job_dir.display()))?;

        Ok(LaunchOutcome {
            cluster_name: cluster_name.to_string(),
            job_id: Some(cluster_name.to_string()),
            pid: Some(pid),
            request_id: None,
            status: "submitted".to_string(),
            message: "Local job started".to_string(),
        })
    }

    /// SIGTERM the recorded pid; already-gone processes stop quietly.
    fn stop_cluster(&self, cluster_name: &str) -> ProviderResult<StopOutcome> {
        let dir = match self.require_run_dir() {
            Ok(d) => d,
            Err(_) => {
                return Ok(StopOutcome {
                    cluster_name: cluster_name.to_string(),
                    status: "unknown".to_string(),
                    message: "workspace_dir (run directory) not set".to_string(),
                })
            }
        };

        match Self::read_pid(dir) {
            None => Ok(StopOutcome {
                cluster_name: cluster_name.to_string(),
                status: "stopped".to_string(),
                message: "No pid file found".to_string(),
            }),
            Some(pid) => {
                let delivered = send_signal(pid, libc::SIGTERM);
                Ok(StopOutcome {
                    cluster_name: cluster_name.to_string(),
                    status: "stopped".to_string(),
                    message: if delivered {
                        "Sent SIGTERM".to_string()
                    } else {
                        "Process already gone".to_string()
                    },
                })
            }
        }
    }

    /// UP while the recorded pid is alive, DOWN otherwise. A missing pid
    /// file reads as DOWN.
    fn get_cluster_status(&self, cluster_name: &str) -> ProviderResult<ClusterStatus> {
        let dir = match self.require_run_dir() {
            Ok(d) => d,
            Err(_) => {
                return Ok(ClusterStatus::unknown(
                    cluster_name,
                    "workspace_dir (run directory) not set",
                ))
            }
        };

        let state = match Self::read_pid(dir) {
            Some(pid) if Self::pid_alive(pid) => ClusterState::Up,
            Some(_) => ClusterState::Down,
            None => ClusterState::Down,
        };

        Ok(ClusterStatus {
            cluster_name: cluster_name.to_string(),
            state,
            status_message: Some(
                match state {
                    ClusterState::Up => "Process running",
                    _ => "Process not running",
                }
                .to_string(),
            ),
            launched_at: None,
            last_use: None,
            autostop: None,
            num_nodes: Some(1),
            resources_str: None,
            provider_data: Default::default(),
        })
    }

    fn get_clusters_detailed(&self) -> ProviderResult<Vec<ClusterDetail>> {
        // No persistent clusters locally
        Ok(Vec::new())
    }

    fn get_cluster_resources(&self, cluster_name: &str) -> ProviderResult<ResourceInfo> {
        Ok(ResourceInfo {
            cluster_name: cluster_name.to_string(),
            num_nodes: Some(1),
            ..Default::default()
        })
    }

    fn submit_job(&self, _cluster_name: &str, _config: &JobConfig) -> ProviderResult<SubmitOutcome> {
        Err(ProviderError::Unsupported(
            "local provider runs the command in launch_cluster; submit_job is not used",
        ))
    }

    /// stdout.log then stderr.log, concatenated; `tail_lines` keeps the
    /// last N lines of the combined output.
    fn get_job_logs(
        &self,
        _cluster_name: &str,
        _job_id: &str,
        tail_lines: Option<usize>,
        _follow: bool,
    ) -> ProviderResult<LogOutput> {
        let dir = match self.require_run_dir() {
            Ok(d) => d,
            Err(_) => {
                return Ok(LogOutput::Full(
                    "workspace_dir (run directory) not set".to_string(),
                ))
            }
        };

        let stdout = std::fs::read_to_string(dir.join("stdout.log")).ok();
        let stderr = std::fs::read_to_string(dir.join("stderr.log")).ok();
        if stdout.is_none() && stderr.is_none() {
            return Ok(LogOutput::Full("No log files found".to_string()));
        }

        let mut out = [stdout, stderr]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(n) = tail_lines {
            let lines: Vec<&str> = out.lines().collect();
            let start = lines.len().saturating_sub(n);
            out = lines[start..].join("\n");
        }

        Ok(LogOutput::Full(out))
    }

    fn cancel_job(&self, cluster_name: &str, job_id: &str) -> ProviderResult<CancelOutcome> {
        let _ = self.stop_cluster(cluster_name)?;
        Ok(CancelOutcome {
            job_id: job_id.to_string(),
            status: "cancelled".to_string(),
        })
    }

    /// Exactly one job per run: RUNNING while the process is up, else
    /// COMPLETED.
    fn list_jobs(&self, cluster_name: &str) -> ProviderResult<Vec<JobInfo>> {
        let status = self.get_cluster_status(cluster_name)?;
        let state = if status.state == ClusterState::Up {
            JobState::Running
        } else {
            JobState::Completed
        };
        Ok(vec![JobInfo {
            job_id: cluster_name.to_string(),
            job_name: Some(cluster_name.to_string()),
            state,
            cluster_name: cluster_name.to_string(),
            command: None,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error_message: None,
            provider_data: Default::default(),
        }])
    }

    fn check(&self) -> bool {
        which::which("uv").is_ok()
    }
}

/// `kill(2)`; returns whether the signal was deliverable, i.e. the
/// process exists and is ours to signal.
#[allow(unsafe_code)]
fn send_signal(pid: i32, signal: i32) -> bool {
    // SAFETY: kill with a valid signal number has no memory effects
    unsafe { libc::kill(pid, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_without_pid_file_is_down() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::for_run(tmp.path().to_path_buf());
        let status = provider.get_cluster_status("42").unwrap();
        assert_eq!(status.state, ClusterState::Down);
    }

    #[test]
    fn status_without_run_dir_is_unknown() {
        let provider = LocalProvider::new();
        let status = provider.get_cluster_status("42").unwrap();
        assert_eq!(status.state, ClusterState::Unknown);
    }

    #[test]
    fn logs_concatenate_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("stdout.log"), "a\nb\nc").unwrap();
        std::fs::write(tmp.path().join("stderr.log"), "x").unwrap();

        let provider = LocalProvider::for_run(tmp.path().to_path_buf());
        let logs = provider
            .get_job_logs("42", "42", None, false)
            .unwrap()
            .into_string();
        assert_eq!(logs, "a\nb\nc\nx");

        let tail = provider
            .get_job_logs("42", "42", Some(2), false)
            .unwrap()
            .into_string();
        assert_eq!(tail, "c\nx");
    }

    #[test]
    fn stop_without_pid_file_is_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::for_run(tmp.path().to_path_buf());
        let outcome = provider.stop_cluster("42").unwrap();
        assert_eq!(outcome.status, "stopped");
    }

    #[test]
    fn launch_requires_workspace_dir() {
        let provider = LocalProvider::new();
        let config = ClusterConfig::builder().build();
        assert!(provider.launch_cluster("42", &config).is_err());
    }
}
