//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! SLURM provider: submits sbatch scripts over SSH or the SLURM REST
//! API (`/slurm/v0.0.39/...`).
//!
//! "Launching a cluster" means submitting a job here; the cluster itself
//! is managed by the site. File mounts are realized as SFTP uploads in
//! SSH mode.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::trace;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::consts::PROVIDER_HTTP_TIMEOUT_SECS;
use crate::provider::error::{ProviderError, ProviderResult};
use crate::provider::models::*;
use crate::provider::ComputeProvider;
use crate::provider::LogOutput;

pub const SLURM_REST_BASE: &str = "/slurm/v0.0.39";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlurmMode {
    Rest,
    Ssh,
}

#[derive(Debug)]
pub struct SlurmProvider {
    mode: SlurmMode,
    rest_url: Option<String>,
    ssh_host: Option<String>,
    ssh_user: String,
    ssh_key_path: Option<String>,
    ssh_port: u16,
    api_token: Option<String>,
    http: reqwest::blocking::Client,
}

impl SlurmProvider {
    pub fn new(
        mode: SlurmMode,
        rest_url: Option<String>,
        ssh_host: Option<String>,
        ssh_user: Option<String>,
        ssh_key_path: Option<String>,
        ssh_port: u16,
        api_token: Option<String>,
    ) -> SlurmProvider {
        let ssh_user = ssh_user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        SlurmProvider {
            mode,
            rest_url,
            ssh_host,
            ssh_user,
            ssh_key_path,
            ssh_port,
            api_token,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(PROVIDER_HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    fn ssh_session(&self) -> Result<ssh2::Session> {
        let host = self
            .ssh_host
            .as_deref()
            .ok_or_else(|| anyhow!("SSH mode requires ssh_host"))?;

        let tcp = TcpStream::connect((host, self.ssh_port))
            .with_context(|| anyhow!("Connecting to {}:{}", host, self.ssh_port))?;
        let mut session = ssh2::Session::new().context("Creating SSH session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| anyhow!("SSH handshake with {}", host))?;

        self.verify_host_key(&session, host)?;

        let key_path = self
            .ssh_key_path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand_home(p)))
            .or_else(|| {
                let default = dirs::home_dir()?.join(".ssh").join("id_rsa");
                default.exists().then_some(default)
            });

        match key_path {
            Some(key) => session
                .userauth_pubkey_file(&self.ssh_user, None, &key, None)
                .with_context(|| anyhow!("SSH key authentication as {}", self.ssh_user))?,
            None => session
                .userauth_agent(&self.ssh_user)
                .with_context(|| anyhow!("SSH agent authentication as {}", self.ssh_user))?,
        }

        Ok(session)
    }

    /// Host key policy: add after first use. Unknown keys are recorded
    /// to `~/.ssh/known_hosts`; a changed key is an error.
    fn verify_host_key(&self, session: &ssh2::Session, host: &str) -> Result<()> {
        let mut known_hosts = session.known_hosts().context("Opening known hosts")?;
        let file = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .ok_or_else(|| anyhow!("No home directory for known_hosts"))?;
        let _ = known_hosts.read_file(&file, ssh2::KnownHostFileKind::OpenSSH);

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| anyhow!("No host key from {}", host))?;

        match known_hosts.check_port(host, self.ssh_port, key) {
            ssh2::CheckResult::Match => Ok(()),
            ssh2::CheckResult::Mismatch => {
                Err(anyhow!("Host key for {} changed; refusing to connect", host))
            }
            ssh2::CheckResult::NotFound | ssh2::CheckResult::Failure => {
                let format = match key_type {
                    ssh2::HostKeyType::Rsa => ssh2::KnownHostKeyFormat::SshRsa,
                    ssh2::HostKeyType::Dss => ssh2::KnownHostKeyFormat::SshDss,
                    _ => ssh2::KnownHostKeyFormat::Unknown,
                };
                known_hosts
                    .add(host, key, "", format)
                    .context("Recording host key")?;
                if let Some(parent) = file.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                known_hosts
                    .write_file(&file, ssh2::KnownHostFileKind::OpenSSH)
                    .with_context(|| anyhow!("Writing {}", file.display()))?;
                Ok(())
            }
        }
    }

    fn ssh_execute(&self, command: &str) -> Result<String> {
        trace!("SSH exec: {}", command);
        let session = self.ssh_session()?;
        let mut channel = session.channel_session().context("Opening SSH channel")?;
        channel
            .exec(command)
            .with_context(|| anyhow!("Executing via SSH: {}", command))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .context("Reading SSH stdout")?;
        let mut errors = String::new();
        let _ = channel.stderr().read_to_string(&mut errors);
        let _ = channel.wait_close();

        if !errors.is_empty() {
            // Some commands report to stderr and still succeed
            trace!("SSH stderr: {}", errors.trim_end());
        }

        Ok(output)
    }

    /// Upload a local file or directory to the remote host, creating
    /// remote directories as needed. Realizes `file_mounts` semantics
    /// (`{remote: local}`).
    fn sftp_upload(&self, local: &str, remote: &str) -> Result<()> {
        let local_path = PathBuf::from(shellexpand_home(local));
        if !local_path.exists() {
            return Err(anyhow!(
                "Local path for file_mounts does not exist: {}",
                local_path.display()
            ));
        }

        let session = self.ssh_session()?;
        let sftp = session.sftp().context("Opening SFTP channel")?;

        fn mkdir_p(sftp: &ssh2::Sftp, remote_dir: &str) {
            let mut path = String::new();
            for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
                path.push('/');
                path.push_str(part);
                let p = Path::new(&path);
                if sftp.stat(p).is_err() {
                    // Creation failures surface on the upload itself
                    let _ = sftp.mkdir(p, 0o755);
                }
            }
        }

        fn upload_file(sftp: &ssh2::Sftp, local: &Path, remote: &str) -> Result<()> {
            use std::io::Write;
            mkdir_p(sftp, crate::storage::parent(remote));
            let data = std::fs::read(local)
                .with_context(|| anyhow!("Reading {}", local.display()))?;
            let mut file = sftp
                .create(Path::new(remote))
                .with_context(|| anyhow!("Creating remote file {}", remote))?;
            file.write_all(&data)
                .with_context(|| anyhow!("Uploading {}", remote))?;
            Ok(())
        }

        if local_path.is_dir() {
            for entry in walkdir::WalkDir::new(&local_path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&local_path)
                    .context("Computing relative upload path")?;
                let remote_file = format!(
                    "{}/{}",
                    remote.trim_end_matches('/'),
                    rel.to_string_lossy()
                );
                upload_file(&sftp, entry.path(), &remote_file)?;
            }
            Ok(())
        } else {
            upload_file(&sftp, &local_path, remote)
        }
    }

    fn rest_request(&self, method: reqwest::Method, endpoint: &str, body: Option<Value>) -> ProviderResult<Value> {
        let base = self
            .rest_url
            .as_deref()
            .ok_or_else(|| ProviderError::Launch("REST mode requires rest_url".into()))?;
        let url = format!("{}{}", base.trim_end_matches('/'), endpoint);

        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json");
        if let Some(token) = &self.api_token {
            request = request
                .header("X-SLURM-USER-NAME", &self.ssh_user)
                .header("X-SLURM-USER-TOKEN", token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .map_err(|e| ProviderError::from_http(&url, e.status().map(|s| s.as_u16()), &e.to_string()))?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderError::from_http(&url, Some(status.as_u16()), &text));
        }
        if text.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("Decoding {}: {}", url, e)))
    }

    /// Render the sbatch script: header directives, setup block,
    /// environment exports, then the command.
    fn render_launch_script(cluster_name: &str, config: &ClusterConfig) -> String {
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name={}\n", cluster_name));
        if let Some(nodes) = config.num_nodes.filter(|n| *n > 1) {
            script.push_str(&format!("#SBATCH --nodes={}\n", nodes));
        }
        if let Some(setup) = config.setup.as_deref().filter(|s| !s.is_empty()) {
            script.push_str(&format!("\n# Setup commands\n{}\n", setup));
        }
        for (key, value) in &config.env_vars {
            script.push_str(&format!("export {}={}\n", key, value));
        }
        if let Some(command) = config.command.as_deref().filter(|c| !c.is_empty()) {
            script.push_str(&format!("\n# Main command\n{}\n", command));
        }
        script
    }

    fn render_job_script(config: &JobConfig) -> String {
        let mut script = String::from("#!/bin/bash\n");
        if let Some(name) = config.job_name.as_deref() {
            script.push_str(&format!("#SBATCH --job-name={}\n", name));
        }
        if let Some(nodes) = config.num_nodes {
            script.push_str(&format!("#SBATCH --nodes={}\n", nodes));
        }
        if let Some(timeout) = config.timeout {
            script.push_str(&format!("#SBATCH --time={}\n", timeout));
        }
        for (key, value) in &config.env_vars {
            script.push_str(&format!("export {}={}\n", key, value));
        }
        script.push_str(&format!("\n{}\n", config.command));
        script
    }

    /// `sbatch` prints `Submitted batch job <id>` on success.
    fn parse_sbatch_job_id(output: &str) -> Option<String> {
        output
            .lines()
            .find(|line| line.contains("Submitted batch job"))
            .and_then(|line| line.split_whitespace().last())
            .map(|id| id.to_string())
    }

    fn submit_script_ssh(&self, script_name: &str, script: &str) -> Result<Option<String>> {
        let command = format!(
            "cat > {name} << \"EOFSLURM\"\n{script}\nEOFSLURM\nsbatch {name}",
            name = script_name,
            script = script,
        );
        let output = self.ssh_execute(&command)?;
        Ok(Self::parse_sbatch_job_id(&output))
    }

    fn submit_script_rest(&self, job_name: Option<&str>, script: &str) -> ProviderResult<Option<String>> {
        let result = self.rest_request(
            reqwest::Method::POST,
            &format!("{}/job/submit", SLURM_REST_BASE),
            Some(json!({ "script": script, "job": { "name": job_name } })),
        )?;
        Ok(result.get("job_id").map(value_to_id))
    }

    /// Parse `sinfo -h -o '%P %G %c %m %D'` output:
    /// PARTITION GRES CPUS MEMORY NODES.
    fn parse_sinfo_resources(cluster_name: &str, output: &str) -> ResourceInfo {
        let mut info = ResourceInfo {
            cluster_name: cluster_name.to_string(),
            ..Default::default()
        };

        let line = match output.lines().find(|l| !l.trim().is_empty()) {
            Some(l) => l,
            None => return info,
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return info;
        }

        let gres = parts[1].trim();
        if gres.to_lowercase().contains("gpu") {
            // GRES reads like "gpu:2" or just "gpu"
            let count = gres
                .split(':')
                .nth(1)
                .and_then(|c| c.trim().parse::<u32>().ok())
                .unwrap_or(1);
            info.gpus.push(GpuInfo {
                gpu: "gpu".to_string(),
                count,
            });
        }

        info.cpus = parts[2].parse::<u32>().ok();

        // %m reports MB, but some site configs hand out GB directly;
        // anything under 100 is taken as GB already
        if let Ok(memory) = parts[3].parse::<u64>() {
            info.memory_gb = Some(if memory < 100 {
                memory as f64
            } else {
                memory as f64 / 1024.0
            });
        }

        info.num_nodes = parts[4].parse::<u32>().ok();
        info
    }
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

fn value_to_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ComputeProvider for SlurmProvider {
    /// Launching means submitting: synthesize an sbatch script from the
    /// cluster config and hand it to the scheduler. File mounts are
    /// uploaded first in SSH mode.
    fn launch_cluster(
        &self,
        cluster_name: &str,
        config: &ClusterConfig,
    ) -> ProviderResult<LaunchOutcome> {
        if self.mode == SlurmMode::Ssh && !config.file_mounts.is_empty() {
            for (remote, local) in &config.file_mounts {
                self.sftp_upload(local, remote)
                    .map_err(|e| ProviderError::Launch(e.to_string()))?;
            }
        }

        let script = Self::render_launch_script(cluster_name, config);
        debug!("Submitting sbatch script for {}", cluster_name);

        let job_id = match self.mode {
            SlurmMode::Ssh => self
                .submit_script_ssh(&format!("/tmp/cluster_{}.sh", cluster_name), &script)
                .map_err(|e| ProviderError::Launch(e.to_string()))?,
            SlurmMode::Rest => self.submit_script_rest(Some(cluster_name), &script)?,
        };

        Ok(LaunchOutcome {
            cluster_name: cluster_name.to_string(),
            job_id,
            pid: None,
            request_id: None,
            status: "submitted".to_string(),
            message: "SLURM job submitted".to_string(),
        })
    }

    /// SLURM clusters are managed by the site; stopping is a no-op.
    fn stop_cluster(&self, cluster_name: &str) -> ProviderResult<StopOutcome> {
        Ok(StopOutcome {
            cluster_name: cluster_name.to_string(),
            status: "stopped".to_string(),
            message: "SLURM clusters are managed externally".to_string(),
        })
    }

    fn get_cluster_status(&self, cluster_name: &str) -> ProviderResult<ClusterStatus> {
        let state = match self.mode {
            SlurmMode::Ssh => match self.ssh_execute("sinfo -h -o '%P %A %D %T'") {
                Ok(output) if output.lines().any(|l| !l.trim().is_empty()) => ClusterState::Up,
                Ok(_) => ClusterState::Unknown,
                Err(_) => ClusterState::Unknown,
            },
            SlurmMode::Rest => {
                match self.rest_request(
                    reqwest::Method::GET,
                    &format!("{}/partitions", SLURM_REST_BASE),
                    None,
                ) {
                    Ok(result) if !result.is_null() => ClusterState::Up,
                    _ => ClusterState::Unknown,
                }
            }
        };

        Ok(ClusterStatus {
            cluster_name: cluster_name.to_string(),
            state,
            status_message: Some("SLURM cluster status".to_string()),
            launched_at: None,
            last_use: None,
            autostop: None,
            num_nodes: None,
            resources_str: None,
            provider_data: Default::default(),
        })
    }

    fn get_clusters_detailed(&self) -> ProviderResult<Vec<ClusterDetail>> {
        // One logical cluster per provider configuration
        let status = self.get_cluster_status("slurm")?;
        let resources = self.get_cluster_resources("slurm")?;

        let mut gpus = std::collections::BTreeMap::new();
        for gpu in &resources.gpus {
            gpus.insert(gpu.gpu.clone(), gpu.count);
        }
        let is_up = status.state == ClusterState::Up;

        Ok(vec![ClusterDetail {
            cluster_id: "slurm".to_string(),
            cluster_name: "slurm".to_string(),
            backend_type: "SLURM".to_string(),
            elastic_enabled: false,
            max_nodes: resources.num_nodes.unwrap_or(1),
            head_node_ip: self.ssh_host.clone(),
            nodes: vec![NodeDetail {
                node_name: self
                    .ssh_host
                    .clone()
                    .or_else(|| self.rest_url.clone())
                    .unwrap_or_else(|| "slurm".to_string()),
                is_fixed: true,
                is_active: is_up,
                state: status.state.to_string(),
                reason: status.status_message.clone(),
                resources: NodeResources {
                    cpus_total: resources.cpus.unwrap_or(0) as f64,
                    cpus_allocated: 0.0,
                    gpus_free: gpus.clone(),
                    gpus,
                    memory_gb_total: resources.memory_gb.unwrap_or(0.0),
                    memory_gb_allocated: 0.0,
                },
            }],
        }])
    }

    fn get_cluster_resources(&self, cluster_name: &str) -> ProviderResult<ResourceInfo> {
        match self.mode {
            SlurmMode::Ssh => {
                let output = self
                    .ssh_execute("sinfo -h -o '%P %G %c %m %D'")
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
                Ok(Self::parse_sinfo_resources(cluster_name, &output))
            }
            SlurmMode::Rest => {
                let mut info = ResourceInfo {
                    cluster_name: cluster_name.to_string(),
                    ..Default::default()
                };
                if let Ok(result) = self.rest_request(
                    reqwest::Method::GET,
                    &format!("{}/nodes", SLURM_REST_BASE),
                    None,
                ) {
                    info.num_nodes = result
                        .get("nodes")
                        .and_then(Value::as_array)
                        .map(|nodes| nodes.len() as u32);
                }
                Ok(info)
            }
        }
    }

    fn submit_job(&self, cluster_name: &str, config: &JobConfig) -> ProviderResult<SubmitOutcome> {
        let script = Self::render_job_script(config);
        let job_id = match self.mode {
            SlurmMode::Ssh => {
                let script_name = format!(
                    "/tmp/job_{}.sh",
                    config.job_name.as_deref().unwrap_or("tmp")
                );
                self.submit_script_ssh(&script_name, &script)
                    .map_err(|e| ProviderError::Launch(e.to_string()))?
            }
            SlurmMode::Rest => self.submit_script_rest(config.job_name.as_deref(), &script)?,
        };

        Ok(SubmitOutcome {
            cluster_name: cluster_name.to_string(),
            job_id,
            request_id: None,
        })
    }

    fn get_job_logs(
        &self,
        _cluster_name: &str,
        job_id: &str,
        tail_lines: Option<usize>,
        _follow: bool,
    ) -> ProviderResult<LogOutput> {
        match self.mode {
            SlurmMode::Ssh => {
                let command = match tail_lines {
                    // Without a shared log path convention, the accounting
                    // record is the best available answer for full logs
                    None => format!(
                        "sacct -j {} -o JobID,State,ExitCode,Start,End --noheader",
                        job_id
                    ),
                    Some(n) => format!("tail -n {} slurm-{}.out", n, job_id),
                };
                let output = self
                    .ssh_execute(&command)
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
                Ok(LogOutput::Full(output))
            }
            SlurmMode::Rest => {
                let result = self.rest_request(
                    reqwest::Method::GET,
                    &format!("{}/job/{}", SLURM_REST_BASE, job_id),
                    None,
                )?;
                let logs = result
                    .get("logs")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| result.to_string());
                Ok(LogOutput::Full(logs))
            }
        }
    }

    fn cancel_job(&self, _cluster_name: &str, job_id: &str) -> ProviderResult<CancelOutcome> {
        match self.mode {
            SlurmMode::Ssh => {
                self.ssh_execute(&format!("scancel {}", job_id))
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
            }
            SlurmMode::Rest => {
                self.rest_request(
                    reqwest::Method::DELETE,
                    &format!("{}/job/{}", SLURM_REST_BASE, job_id),
                    None,
                )?;
            }
        }
        Ok(CancelOutcome {
            job_id: job_id.to_string(),
            status: "cancelled".to_string(),
        })
    }

    fn list_jobs(&self, cluster_name: &str) -> ProviderResult<Vec<JobInfo>> {
        match self.mode {
            SlurmMode::Ssh => {
                let output = self
                    .ssh_execute(&format!(
                        "squeue -u {} -o \"%i %j %T %S %e\" --noheader",
                        self.ssh_user
                    ))
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;

                let mut jobs = Vec::new();
                for line in output.lines().filter(|l| !l.trim().is_empty()) {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() < 3 {
                        continue;
                    }
                    let state = parts[2]
                        .to_uppercase()
                        .parse::<JobState>()
                        .unwrap_or(JobState::Unknown);
                    jobs.push(JobInfo {
                        job_id: parts[0].to_string(),
                        job_name: Some(parts[1].to_string()),
                        state,
                        cluster_name: cluster_name.to_string(),
                        command: None,
                        submitted_at: None,
                        started_at: parts.get(3).map(|s| s.to_string()),
                        finished_at: parts.get(4).map(|s| s.to_string()),
                        exit_code: None,
                        error_message: None,
                        provider_data: Default::default(),
                    });
                }
                Ok(jobs)
            }
            SlurmMode::Rest => {
                let result = self.rest_request(
                    reqwest::Method::GET,
                    &format!("{}/jobs", SLURM_REST_BASE),
                    None,
                )?;
                let mut jobs = Vec::new();
                for job in result
                    .get("jobs")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                {
                    let state = job
                        .get("job_state")
                        .and_then(Value::as_str)
                        .unwrap_or("UNKNOWN")
                        .to_uppercase()
                        .parse::<JobState>()
                        .unwrap_or(JobState::Unknown);
                    jobs.push(JobInfo {
                        job_id: job.get("job_id").map(value_to_id).unwrap_or_default(),
                        job_name: job
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        state,
                        cluster_name: cluster_name.to_string(),
                        command: None,
                        submitted_at: job
                            .get("submit_time")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        started_at: job
                            .get("start_time")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        finished_at: job
                            .get("end_time")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        exit_code: job.get("exit_code").and_then(Value::as_i64).map(|c| c as i32),
                        error_message: None,
                        provider_data: job.as_object().cloned().unwrap_or_default(),
                    });
                }
                Ok(jobs)
            }
        }
    }

    fn check(&self) -> bool {
        match self.mode {
            SlurmMode::Ssh => self.ssh_execute("sinfo --version").is_ok(),
            SlurmMode::Rest => self
                .rest_request(
                    reqwest::Method::GET,
                    &format!("{}/diag", SLURM_REST_BASE),
                    None,
                )
                .is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_script_layout() {
        let config = ClusterConfig::builder()
            .num_nodes(Some(2))
            .setup(Some("module load cuda".to_string()))
            .command(Some("python train.py".to_string()))
            .env_vars([("HF_TOKEN".to_string(), "t".to_string())].into())
            .build();

        let script = SlurmProvider::render_launch_script("exp-1", &config);
        assert!(script.starts_with("#!/bin/bash\n#SBATCH --job-name=exp-1\n"));
        assert!(script.contains("#SBATCH --nodes=2"));
        assert!(script.contains("module load cuda"));
        assert!(script.contains("export HF_TOKEN=t"));
        assert!(script.ends_with("python train.py\n"));
        // setup precedes exports, exports precede the command
        let setup_pos = script.find("module load cuda").unwrap();
        let export_pos = script.find("export HF_TOKEN").unwrap();
        let cmd_pos = script.find("python train.py").unwrap();
        assert!(setup_pos < export_pos && export_pos < cmd_pos);
    }

    #[test]
    fn single_node_launch_has_no_nodes_directive() {
        let config = ClusterConfig::builder().command(Some("true".to_string())).build();
        let script = SlurmProvider::render_launch_script("c", &config);
        assert!(!script.contains("--nodes"));
    }

    #[test]
    fn job_script_carries_time_limit() {
        let config = JobConfig::builder()
            .command("srun hostname".to_string())
            .job_name(Some("probe".to_string()))
            .num_nodes(Some(1))
            .timeout(Some(60))
            .build();
        let script = SlurmProvider::render_job_script(&config);
        assert!(script.contains("#SBATCH --job-name=probe"));
        assert!(script.contains("#SBATCH --nodes=1"));
        assert!(script.contains("#SBATCH --time=60"));
    }

    #[test]
    fn sbatch_output_parses_job_id() {
        let output = "some noise\nSubmitted batch job 12345\n";
        assert_eq!(
            SlurmProvider::parse_sbatch_job_id(output),
            Some("12345".to_string())
        );
        assert_eq!(SlurmProvider::parse_sbatch_job_id("error"), None);
    }

    #[test]
    fn sinfo_resources_parse_with_memory_heuristic() {
        let info =
            SlurmProvider::parse_sinfo_resources("c", "batch gpu:4 64 256000 3\n");
        assert_eq!(info.gpus, vec![GpuInfo { gpu: "gpu".to_string(), count: 4 }]);
        assert_eq!(info.cpus, Some(64));
        assert_eq!(info.memory_gb, Some(250.0));
        assert_eq!(info.num_nodes, Some(3));

        // small memory figures are already GB
        let info = SlurmProvider::parse_sinfo_resources("c", "batch (null) 8 64 1\n");
        assert_eq!(info.memory_gb, Some(64.0));
        assert!(info.gpus.is_empty());
    }
}
