//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Normalized shapes crossing the provider boundary.
//!
//! Providers translate a uniform `ClusterConfig`/`JobConfig` into
//! backend-specific calls and normalize status, log and resource data
//! back into these types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use typed_builder::TypedBuilder;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    parse_display::Display,
    parse_display::FromStr,
)]
pub enum ClusterState {
    #[display("UNKNOWN")]
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[display("INIT")]
    #[serde(rename = "INIT")]
    Init,
    #[display("UP")]
    #[serde(rename = "UP")]
    Up,
    #[display("STOPPED")]
    #[serde(rename = "STOPPED")]
    Stopped,
    #[display("DOWN")]
    #[serde(rename = "DOWN")]
    Down,
    #[display("FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    parse_display::Display,
    parse_display::FromStr,
)]
pub enum JobState {
    #[display("PENDING")]
    #[serde(rename = "PENDING")]
    Pending,
    #[display("RUNNING")]
    #[serde(rename = "RUNNING")]
    Running,
    #[display("COMPLETED")]
    #[serde(rename = "COMPLETED")]
    Completed,
    #[display("FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
    #[display("CANCELLED")]
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[display("UNKNOWN")]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

/// Per-launch knobs that are specific to one backend. The dispatcher
/// only ever sets `workspace_dir` (local provider); the remaining fields
/// pass operator overrides through to the pod backends.
#[derive(Clone, Debug, Default, Serialize, Deserialize, TypedBuilder)]
pub struct LaunchOverrides {
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,

    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk_gb: Option<u64>,

    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_volume_id: Option<String>,
}

/// Configuration for provisioning compute and starting a command on it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, TypedBuilder)]
pub struct ClusterConfig {
    #[builder(default)]
    #[serde(default)]
    pub cluster_name: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub provider_name: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub instance_type: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub cpus: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub memory: Option<String>,

    /// Accelerator spec, e.g. `"A100:1"` or `"V100:2"`
    #[builder(default)]
    #[serde(default)]
    pub accelerators: Option<String>,

    /// Disk size in GB
    #[builder(default)]
    #[serde(default)]
    pub disk_size: Option<u64>,

    #[builder(default = Some(1))]
    #[serde(default)]
    pub num_nodes: Option<u32>,

    #[builder(default)]
    #[serde(default)]
    pub cloud: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub region: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub zone: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub use_spot: bool,

    #[builder(default)]
    #[serde(default)]
    pub idle_minutes_to_autostop: Option<u32>,

    /// Command to run once the compute is up
    #[builder(default)]
    #[serde(default)]
    pub command: Option<String>,

    /// Setup script run before the command
    #[builder(default)]
    #[serde(default)]
    pub setup: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    /// File mounts as `{remote: local}`. SSH-mode SLURM interprets these
    /// as SFTP uploads.
    #[builder(default)]
    #[serde(default)]
    pub file_mounts: BTreeMap<String, String>,

    #[builder(default)]
    #[serde(default)]
    pub provider_config: LaunchOverrides,
}

/// Configuration for submitting a job to an existing cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize, TypedBuilder)]
pub struct JobConfig {
    pub command: String,

    #[builder(default)]
    #[serde(default)]
    pub job_name: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[builder(default)]
    #[serde(default)]
    pub num_nodes: Option<u32>,

    /// Timeout in seconds
    #[builder(default)]
    #[serde(default)]
    pub timeout: Option<u64>,

    #[builder(default)]
    #[serde(default)]
    pub provider_config: LaunchOverrides,
}

/// Normalized cluster status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub state: ClusterState,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub launched_at: Option<String>,
    #[serde(default)]
    pub last_use: Option<String>,
    /// Minutes until autostop
    #[serde(default)]
    pub autostop: Option<i64>,
    #[serde(default)]
    pub num_nodes: Option<u32>,
    /// Human-readable resource description
    #[serde(default)]
    pub resources_str: Option<String>,
    #[serde(default)]
    pub provider_data: Map<String, Value>,
}

impl ClusterStatus {
    pub fn unknown(cluster_name: &str, message: &str) -> ClusterStatus {
        ClusterStatus {
            cluster_name: cluster_name.to_string(),
            state: ClusterState::Unknown,
            status_message: Some(message.to_string()),
            launched_at: None,
            last_use: None,
            autostop: None,
            num_nodes: None,
            resources_str: None,
            provider_data: Default::default(),
        }
    }
}

/// Normalized job information.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    #[serde(default)]
    pub job_name: Option<String>,
    pub state: JobState,
    pub cluster_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub provider_data: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub gpu: String,
    pub count: u32,
}

/// Normalized resource information for one cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub cluster_name: String,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
    #[serde(default)]
    pub num_nodes: Option<u32>,
    #[serde(default)]
    pub provider_data: Map<String, Value>,
}

/// Per-node resource counters for the detailed cluster view.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpus_total: f64,
    pub cpus_allocated: f64,
    pub gpus: BTreeMap<String, u32>,
    pub gpus_free: BTreeMap<String, u32>,
    pub memory_gb_total: f64,
    pub memory_gb_allocated: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node_name: String,
    pub is_fixed: bool,
    pub is_active: bool,
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub resources: NodeResources,
}

/// Detailed cluster view for UIs: one entry per cluster with per-node
/// resource allocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterDetail {
    pub cluster_id: String,
    pub cluster_name: String,
    pub backend_type: String,
    pub elastic_enabled: bool,
    pub max_nodes: u32,
    #[serde(default)]
    pub head_node_ip: Option<String>,
    pub nodes: Vec<NodeDetail>,
}

/// Result of `launch_cluster`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub cluster_name: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: String,
    pub message: String,
}

/// Result of `stop_cluster`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopOutcome {
    pub cluster_name: String,
    pub status: String,
    pub message: String,
}

/// Result of `submit_job`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub cluster_name: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Result of `cancel_job`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub job_id: String,
    pub status: String,
}

/// Parse an accelerator spec like `"A100:2"` into type and count.
/// A missing or unparseable count reads as 1.
pub fn parse_accelerators(spec: &str) -> (String, u32) {
    let mut parts = spec.splitn(2, ':');
    let gpu_type = parts.next().unwrap_or_default().trim().to_string();
    let count = parts
        .next()
        .and_then(|c| c.trim().parse::<u32>().ok())
        .unwrap_or(1);
    (gpu_type, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerator_specs_parse() {
        assert_eq!(parse_accelerators("A100:2"), ("A100".to_string(), 2));
        assert_eq!(parse_accelerators("V100"), ("V100".to_string(), 1));
        assert_eq!(parse_accelerators("T4:x"), ("T4".to_string(), 1));
    }

    #[test]
    fn states_render_wire_strings() {
        assert_eq!(ClusterState::Up.to_string(), "UP");
        assert_eq!("STOPPED".parse::<ClusterState>().unwrap(), ClusterState::Stopped);
        assert_eq!(JobState::Completed.to_string(), "COMPLETED");
    }

    #[test]
    fn cluster_config_builder_defaults() {
        let cfg = ClusterConfig::builder().build();
        assert_eq!(cfg.num_nodes, Some(1));
        assert!(!cfg.use_spot);
        assert!(cfg.env_vars.is_empty());
    }
}
