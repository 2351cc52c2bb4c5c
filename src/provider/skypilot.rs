//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Provider for a SkyPilot-style remote control plane.
//!
//! Every slow operation is asynchronous on the server: the initial POST
//! returns a request id (response header or body field) and the result
//! is fetched via `GET /api/get?request_id=...`, which blocks until the
//! request settles. Launches always pass `down=true` so clusters tear
//! down after their jobs finish.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::trace;
use log::warn;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::consts::PROVIDER_CHECK_TIMEOUT_SECS;
use crate::consts::PROVIDER_HTTP_TIMEOUT_SECS;
use crate::provider::error::{ProviderError, ProviderResult};
use crate::provider::models::*;
use crate::provider::ComputeProvider;
use crate::provider::LogOutput;

const REQUEST_ID_HEADER: &str = "X-Skypilot-Request-ID";

lazy_static::lazy_static! {
    static ref RE_NODES: regex::Regex =
        regex::Regex::new(r"^(\d+)x\(").expect("static regex");
    static ref RE_GPUS: regex::Regex =
        regex::Regex::new(r"gpus=([\w\d-]+):(\d+)").expect("static regex");
    static ref RE_CPUS: regex::Regex =
        regex::Regex::new(r"cpus=([\d.]+)").expect("static regex");
    static ref RE_MEM: regex::Regex =
        regex::Regex::new(r"mem=([\d.]+)").expect("static regex");
    static ref RE_DISK: regex::Regex =
        regex::Regex::new(r"disk=([\d.]+)").expect("static regex");
}

/// Parse the descriptive resource string of a cluster, e.g.
/// `"1x(gpus=RTX3090:1, cpus=4, mem=16, ..., disk=256)"`.
pub fn parse_resources_str(cluster_name: &str, resources_str: &str) -> ResourceInfo {
    let mut info = ResourceInfo {
        cluster_name: cluster_name.to_string(),
        ..Default::default()
    };

    if let Some(caps) = RE_NODES.captures(resources_str) {
        info.num_nodes = caps[1].parse().ok();
    }
    if let Some(caps) = RE_GPUS.captures(resources_str) {
        if let Ok(count) = caps[2].parse() {
            info.gpus.push(GpuInfo {
                gpu: caps[1].to_string(),
                count,
            });
        }
    }
    if let Some(caps) = RE_CPUS.captures(resources_str) {
        info.cpus = caps[1].parse::<f64>().ok().map(|c| c as u32);
    }
    if let Some(caps) = RE_MEM.captures(resources_str) {
        info.memory_gb = caps[1].parse().ok();
    }
    if let Some(caps) = RE_DISK.captures(resources_str) {
        info.disk_gb = caps[1].parse::<f64>().ok().map(|d| d as u64);
    }

    info
}

fn map_cluster_state(raw: &str) -> ClusterState {
    // Status may arrive as "UP" or "ClusterStatus.UP"
    let raw = raw.rsplit('.').next().unwrap_or(raw).to_uppercase();
    raw.parse().unwrap_or(ClusterState::Unknown)
}

fn map_job_state(raw: &str) -> JobState {
    let raw = raw.rsplit('.').next().unwrap_or(raw).to_uppercase();
    match raw.as_str() {
        "RUNNING" => JobState::Running,
        "SUCCEEDED" => JobState::Completed,
        "FAILED" | "FAILED_SETUP" | "FAILED_DRIVER" => JobState::Failed,
        "CANCELLED" => JobState::Cancelled,
        "PENDING" | "INIT" | "SETTING_UP" => JobState::Pending,
        _ => JobState::Unknown,
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct SkypilotProvider {
    server_url: String,
    api_token: Option<String>,
    default_env_vars: BTreeMap<String, String>,
    default_entrypoint_command: Option<String>,
    /// Control-plane client with a bounded request timeout
    control: reqwest::blocking::Client,
    /// Client for `/api/get` and `/logs`: bounded connect, unbounded read
    stream: reqwest::blocking::Client,
    /// Clouds observed in cluster listings, for the "available but
    /// unused" section of the detailed view
    seen_clouds: Mutex<BTreeSet<String>>,
}

impl SkypilotProvider {
    pub fn new(
        server_url: String,
        api_token: Option<String>,
        default_env_vars: BTreeMap<String, String>,
        default_entrypoint_command: Option<String>,
    ) -> Result<SkypilotProvider> {
        let control = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_HTTP_TIMEOUT_SECS))
            .build()
            .context("Building control plane HTTP client")?;
        let stream = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(PROVIDER_CHECK_TIMEOUT_SECS))
            .build()
            .context("Building streaming HTTP client")?;

        Ok(SkypilotProvider {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_token,
            default_env_vars,
            default_entrypoint_command,
            control,
            stream,
            seen_clouds: Mutex::new(BTreeSet::new()),
        })
    }

    fn request(
        &self,
        client: &reqwest::blocking::Client,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> ProviderResult<reqwest::blocking::Response> {
        let url = format!("{}{}", self.server_url, endpoint);
        trace!("{} {}", method, url);

        let mut request = client
            .request(method, &url)
            .header("Content-Type", "application/json");
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().map_err(|e| {
            ProviderError::from_http(&url, e.status().map(|s| s.as_u16()), &e.to_string())
        })?;
        Ok(response)
    }

    /// Every request body carries the SDK's common envelope fields on
    /// top of the operation payload.
    fn envelope(&self, mut body: Map<String, Value>) -> Value {
        let mut env_vars = self.default_env_vars.clone();
        if let Some(Value::Object(existing)) = body.remove("env_vars") {
            for (k, v) in existing {
                if let Value::String(s) = v {
                    env_vars.insert(k, s);
                }
            }
        }
        if !env_vars.is_empty() {
            body.insert("env_vars".to_string(), json!(env_vars));
        }
        if let Some(cmd) = &self.default_entrypoint_command {
            body.entry("entrypoint_command".to_string())
                .or_insert_with(|| json!(cmd));
        }
        body.entry("using_remote_api_server".to_string())
            .or_insert(json!(false));
        body.entry("override_skypilot_config".to_string())
            .or_insert_with(|| json!({}));
        Value::Object(body)
    }

    /// Pull the request id out of a response: header first, body field
    /// as fallback. Consumes the response.
    fn request_id(response: reqwest::blocking::Response) -> ProviderResult<String> {
        if let Some(id) = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return Ok(id.to_string());
        }

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderError::from_http(
                "extracting request id",
                Some(status.as_u16()),
                &text,
            ));
        }
        serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("request_id").and_then(|r| as_string(r)))
            .ok_or_else(|| {
                ProviderError::Transient(format!("No request id in response: {}", text))
            })
    }

    /// Fetch the settled result of a server-side request. Blocks until
    /// the server answers; 500 responses carry the encoded failure.
    fn wait_request(&self, request_id: &str) -> ProviderResult<Value> {
        let response = self.request(
            &self.stream,
            reqwest::Method::GET,
            &format!("/api/get?request_id={}", request_id),
            None,
        )?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        let payload: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.as_u16() == 500 {
            let detail = payload
                .get("detail")
                .cloned()
                .unwrap_or_else(|| payload.clone());
            let message = detail
                .get("error")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}", detail));
            return Err(ProviderError::Transient(format!(
                "Request {} failed: {}",
                request_id, message
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::from_http(
                &format!("request {}", request_id),
                Some(status.as_u16()),
                &text,
            ));
        }

        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(ProviderError::Transient(format!(
                "Request {} failed with error: {}",
                request_id, error
            )));
        }
        if payload.get("status").and_then(Value::as_str) == Some("CANCELLED") {
            return Err(ProviderError::Transient(format!(
                "Request {} was cancelled",
                request_id
            )));
        }

        match payload.get("return_value") {
            Some(Value::String(encoded)) => {
                // The return value is itself JSON-encoded
                Ok(serde_json::from_str(encoded).unwrap_or(Value::String(encoded.clone())))
            }
            Some(value) => Ok(value.clone()),
            None => Ok(payload),
        }
    }

    /// Render the single-task chain DAG the way the SDK ships it: a
    /// named header document followed by the task document.
    fn build_task_dag(
        name: &str,
        command: Option<&str>,
        setup: Option<&str>,
        env_vars: &BTreeMap<String, String>,
        file_mounts: &BTreeMap<String, String>,
        num_nodes: Option<u32>,
        resources: Option<Value>,
    ) -> ProviderResult<String> {
        let mut task: Map<String, Value> = Default::default();
        task.insert("name".to_string(), json!(name));
        if let Some(run) = command {
            task.insert("run".to_string(), json!(run));
        }
        if let Some(setup) = setup {
            task.insert("setup".to_string(), json!(setup));
        }
        if !env_vars.is_empty() {
            task.insert("envs".to_string(), json!(env_vars));
        }
        if !file_mounts.is_empty() {
            task.insert("file_mounts".to_string(), json!(file_mounts));
        }
        if let Some(nodes) = num_nodes.filter(|n| *n > 1) {
            task.insert("num_nodes".to_string(), json!(nodes));
        }
        if let Some(resources) = resources {
            task.insert("resources".to_string(), resources);
        }

        let task_yaml = serde_yaml::to_string(&Value::Object(task))
            .map_err(|e| ProviderError::Other(anyhow::anyhow!("Serializing task DAG: {}", e)))?;
        Ok(format!("name: {}\n---\n{}", name, task_yaml))
    }

    fn resources_from_config(config: &ClusterConfig) -> Option<Value> {
        let mut resources: Map<String, Value> = Default::default();
        if let Some(instance_type) = &config.instance_type {
            resources.insert("instance_type".to_string(), json!(instance_type));
        }
        if let Some(cpus) = &config.cpus {
            resources.insert("cpus".to_string(), json!(cpus));
        }
        if let Some(memory) = &config.memory {
            resources.insert("memory".to_string(), json!(memory));
        }
        if let Some(accelerators) = &config.accelerators {
            resources.insert("accelerators".to_string(), json!(accelerators));
        }
        if let Some(disk_size) = config.disk_size {
            resources.insert("disk_size".to_string(), json!(disk_size));
        }
        if let Some(cloud) = &config.cloud {
            resources.insert("cloud".to_string(), json!(cloud));
        }
        if let Some(region) = &config.region {
            resources.insert("region".to_string(), json!(region));
        }
        if let Some(zone) = &config.zone {
            resources.insert("zone".to_string(), json!(zone));
        }
        if config.use_spot {
            resources.insert("use_spot".to_string(), json!(true));
        }
        if resources.is_empty() {
            None
        } else {
            Some(Value::Object(resources))
        }
    }

    /// POST /status and wait for the cluster list. `cluster_names`
    /// restricts the query.
    fn fetch_clusters(&self, cluster_names: Option<&[&str]>) -> ProviderResult<Vec<Value>> {
        let mut body: Map<String, Value> = Default::default();
        body.insert(
            "cluster_names".to_string(),
            match cluster_names {
                Some(names) => json!(names),
                None => Value::Null,
            },
        );
        body.insert("refresh".to_string(), json!(false));
        body.insert("all_users".to_string(), json!(true));

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/status",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;
        let result = self.wait_request(&request_id)?;

        let clusters = match result {
            Value::Array(items) => items,
            Value::Object(mut map) => map
                .remove("clusters")
                .and_then(|c| c.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        // Remember which clouds this control plane can reach
        if let Ok(mut seen) = self.seen_clouds.lock() {
            for cluster in &clusters {
                if let Some(cloud) = cluster.get("cloud").and_then(Value::as_str) {
                    seen.insert(cloud.to_lowercase());
                }
            }
        }

        Ok(clusters)
    }

    fn cluster_to_status(cluster: &Value) -> ClusterStatus {
        let name = cluster
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_status = cluster
            .get("status")
            .and_then(as_string)
            .unwrap_or_else(|| "UNKNOWN".to_string());

        ClusterStatus {
            cluster_name: name,
            state: map_cluster_state(&raw_status),
            status_message: Some(raw_status),
            launched_at: cluster.get("launched_at").and_then(as_string),
            last_use: cluster.get("last_use").and_then(as_string),
            autostop: cluster.get("autostop").and_then(Value::as_i64),
            num_nodes: cluster
                .get("num_nodes")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            resources_str: cluster
                .get("resources_str_full")
                .or_else(|| cluster.get("resources_str"))
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            provider_data: cluster.as_object().cloned().unwrap_or_default(),
        }
    }

    fn running_jobs(&self, cluster_name: &str) -> Vec<JobInfo> {
        self.list_jobs(cluster_name)
            .unwrap_or_default()
            .into_iter()
            .filter(|j| matches!(j.state, JobState::Running | JobState::Pending))
            .collect()
    }

    /// The SSH node pool section of the detailed view: physical nodes
    /// from `/kubernetes_node_info`, with GPU allocation recomputed from
    /// the clusters running on the pool. The kube free-counts are not
    /// trusted because they lag reality.
    fn ssh_pool_details(
        &self,
        ssh_clusters_by_pool: &HashMap<String, Vec<ClusterStatus>>,
    ) -> ProviderResult<Vec<ClusterDetail>> {
        let response = self.request(
            &self.control,
            reqwest::Method::GET,
            "/ssh_node_pools",
            None,
        )?;
        let pools: Map<String, Value> = response
            .json::<Value>()
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let mut details = Vec::new();
        for (pool_name, pool_info) in pools {
            match self.one_ssh_pool_detail(&pool_name, &pool_info, ssh_clusters_by_pool) {
                Ok(Some(detail)) => details.push(detail),
                Ok(None) => {}
                Err(e) => warn!("Failed to process SSH pool {}: {}", pool_name, e),
            }
        }
        Ok(details)
    }

    fn one_ssh_pool_detail(
        &self,
        pool_name: &str,
        pool_info: &Value,
        ssh_clusters_by_pool: &HashMap<String, Vec<ClusterStatus>>,
    ) -> ProviderResult<Option<ClusterDetail>> {
        let ssh_context = format!("ssh-{}", pool_name);
        let mut body: Map<String, Value> = Default::default();
        body.insert("context".to_string(), json!(ssh_context));

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/kubernetes_node_info",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;

        // Node info settles quickly; poll a few times instead of
        // holding a long request open per pool
        let mut node_info_dict: Map<String, Value> = Default::default();
        for attempt in 0..10 {
            std::thread::sleep(Duration::from_millis(500));
            match self.wait_request(&request_id) {
                Ok(result) => {
                    if let Some(dict) = result
                        .get("node_info_dict")
                        .and_then(Value::as_object)
                        .cloned()
                    {
                        node_info_dict = dict;
                        break;
                    }
                }
                Err(e) if attempt == 9 => {
                    return Err(e);
                }
                Err(_) => {}
            }
        }
        if node_info_dict.is_empty() {
            return Ok(None);
        }

        // Resource usage of every cluster running on this pool
        let running_clusters = ssh_clusters_by_pool
            .get(pool_name)
            .cloned()
            .unwrap_or_default();
        struct PoolCluster {
            name: String,
            is_up: bool,
            state: String,
            gpus: BTreeMap<String, u32>,
            cpus: u32,
            memory_gb: f64,
            running_jobs: Vec<JobInfo>,
        }
        let mut cluster_usage = Vec::new();
        for status in &running_clusters {
            let resources = self.get_cluster_resources(&status.cluster_name)?;
            let mut gpus = BTreeMap::new();
            for gpu in &resources.gpus {
                *gpus.entry(gpu.gpu.clone()).or_insert(0) += gpu.count;
            }
            cluster_usage.push(PoolCluster {
                name: status.cluster_name.clone(),
                is_up: matches!(status.state, ClusterState::Up | ClusterState::Init),
                state: status.state.to_string(),
                gpus,
                cpus: resources.cpus.unwrap_or(0),
                memory_gb: resources.memory_gb.unwrap_or(0.0),
                running_jobs: self.running_jobs(&status.cluster_name),
            });
        }

        let mut nodes = Vec::new();
        let mut gpu_node_identities: BTreeSet<String> = BTreeSet::new();

        for (k8s_node_name, k8s_node_info) in &node_info_dict {
            let accelerator_type = k8s_node_info
                .get("accelerator_type")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            let is_ready = k8s_node_info
                .get("is_ready")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let total_gpus = k8s_node_info
                .get("total")
                .and_then(|t| t.get("accelerator_count"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;

            let mut gpus = BTreeMap::new();
            if let Some(acc) = accelerator_type.as_deref().filter(|_| total_gpus > 0) {
                gpus.insert(acc.to_string(), total_gpus);
            }

            // Allocation is the sum over up clusters requesting this
            // accelerator type on the pool
            let mut allocated_gpus = 0u32;
            let mut using_clusters = Vec::new();
            for cluster in &cluster_usage {
                if !cluster.is_up {
                    continue;
                }
                for (gpu_type, count) in &cluster.gpus {
                    if Some(gpu_type.as_str()) == accelerator_type.as_deref() {
                        allocated_gpus += *count;
                        using_clusters.push(cluster);
                    }
                }
            }

            let free_gpus = total_gpus.saturating_sub(allocated_gpus);
            let mut gpus_free = BTreeMap::new();
            if let Some(acc) = accelerator_type.as_deref().filter(|_| free_gpus > 0) {
                gpus_free.insert(acc.to_string(), free_gpus);
            }

            let (state, is_active, reason) = if !is_ready {
                ("DOWN".to_string(), false, "Node not ready".to_string())
            } else if allocated_gpus > 0 {
                let state = if free_gpus == 0 { "ALLOCATED" } else { "MIXED" };
                let reason = if using_clusters.is_empty() {
                    format!("{}/{} GPUs allocated", allocated_gpus, total_gpus)
                } else {
                    using_clusters
                        .iter()
                        .take(2)
                        .map(|c| match c.running_jobs.first() {
                            Some(job) => format!(
                                "{}: {}",
                                c.name,
                                job.job_name
                                    .clone()
                                    .unwrap_or_else(|| format!("job-{}", job.job_id))
                            ),
                            None => format!("{} ({})", c.name, c.state),
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                };
                (state.to_string(), true, reason)
            } else {
                let reason = if total_gpus > 0 {
                    format!("{} GPUs available", total_gpus)
                } else {
                    "Available".to_string()
                };
                ("IDLE".to_string(), false, reason)
            };

            let node_name = k8s_node_info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(k8s_node_name)
                .to_string();
            if let Some(ip) = k8s_node_info.get("ip_address").and_then(Value::as_str) {
                gpu_node_identities.insert(ip.to_string());
            }
            gpu_node_identities.insert(node_name.clone());

            nodes.push(NodeDetail {
                node_name,
                is_fixed: true,
                is_active,
                state,
                reason: Some(reason),
                resources: NodeResources {
                    cpus_total: 0.0,
                    cpus_allocated: 0.0,
                    gpus,
                    gpus_free,
                    memory_gb_total: 0.0,
                    memory_gb_allocated: 0.0,
                },
            });
        }

        // Hosts absent from the kube view are CPU-only nodes
        for host in pool_info
            .get("hosts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            let host_ip = match host.get("ip").and_then(Value::as_str) {
                Some(ip) => ip.to_string(),
                None => continue,
            };
            if gpu_node_identities.contains(&host_ip) {
                continue;
            }

            let cpu_clusters: Vec<&PoolCluster> = cluster_usage
                .iter()
                .filter(|c| c.is_up && c.gpus.is_empty())
                .collect();
            let cpus_allocated: u32 = cpu_clusters.iter().map(|c| c.cpus).sum();
            let memory_allocated: f64 = cpu_clusters.iter().map(|c| c.memory_gb).sum();

            let (state, is_active, reason) = if cpu_clusters.is_empty() {
                (
                    "IDLE".to_string(),
                    false,
                    "CPU-only node available".to_string(),
                )
            } else {
                let reason = cpu_clusters
                    .iter()
                    .take(2)
                    .map(|c| match c.running_jobs.first() {
                        Some(job) => format!(
                            "{}: {}",
                            c.name,
                            job.job_name
                                .clone()
                                .unwrap_or_else(|| format!("job-{}", job.job_id))
                        ),
                        None => format!("{} ({})", c.name, c.state),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                ("ALLOCATED".to_string(), true, reason)
            };

            nodes.push(NodeDetail {
                node_name: host_ip,
                is_fixed: true,
                is_active,
                state,
                reason: Some(reason),
                resources: NodeResources {
                    cpus_total: cpus_allocated as f64,
                    cpus_allocated: cpus_allocated as f64,
                    gpus: BTreeMap::new(),
                    gpus_free: BTreeMap::new(),
                    memory_gb_total: memory_allocated,
                    memory_gb_allocated: memory_allocated,
                },
            });
        }

        if nodes.is_empty() {
            return Ok(None);
        }

        let max_nodes = nodes.len() as u32;
        Ok(Some(ClusterDetail {
            cluster_id: format!("ssh-{}", pool_name),
            cluster_name: pool_name.to_string(),
            backend_type: "SkyPilot".to_string(),
            elastic_enabled: false,
            max_nodes,
            head_node_ip: None,
            nodes,
        }))
    }
}

impl ComputeProvider for SkypilotProvider {
    /// Build the single-task DAG and POST it to `/launch`. The server
    /// answers with a request id; the launch itself proceeds remotely.
    fn launch_cluster(
        &self,
        cluster_name: &str,
        config: &ClusterConfig,
    ) -> ProviderResult<LaunchOutcome> {
        let dag = Self::build_task_dag(
            cluster_name,
            config.command.as_deref(),
            config.setup.as_deref(),
            &config.env_vars,
            &config.file_mounts,
            config.num_nodes,
            Self::resources_from_config(config),
        )?;

        let mut body: Map<String, Value> = Default::default();
        body.insert("task".to_string(), json!(dag));
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert("retry_until_up".to_string(), json!(false));
        body.insert(
            "idle_minutes_to_autostop".to_string(),
            json!(config.idle_minutes_to_autostop),
        );
        body.insert("dryrun".to_string(), json!(false));
        // Tear the cluster down once its jobs finish
        body.insert("down".to_string(), json!(true));
        body.insert("backend".to_string(), Value::Null);
        body.insert("optimize_target".to_string(), json!(0));
        body.insert("no_setup".to_string(), json!(false));
        body.insert("clone_disk_from".to_string(), Value::Null);
        body.insert("fast".to_string(), json!(false));
        body.insert("quiet_optimizer".to_string(), json!(false));
        body.insert("is_launched_by_jobs_controller".to_string(), json!(false));
        body.insert(
            "is_launched_by_sky_serve_controller".to_string(),
            json!(false),
        );
        body.insert("disable_controller_check".to_string(), json!(false));
        body.insert("env_vars".to_string(), json!(config.env_vars));

        debug!("Launching cluster {} via control plane", cluster_name);
        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/launch",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;

        Ok(LaunchOutcome {
            cluster_name: cluster_name.to_string(),
            job_id: None,
            pid: None,
            request_id: Some(request_id),
            status: "submitted".to_string(),
            message: "Launch request accepted".to_string(),
        })
    }

    fn stop_cluster(&self, cluster_name: &str) -> ProviderResult<StopOutcome> {
        let mut body: Map<String, Value> = Default::default();
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert("purge".to_string(), json!(false));

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/down",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;

        match self.wait_request(&request_id) {
            Ok(_) => Ok(StopOutcome {
                cluster_name: cluster_name.to_string(),
                status: "stopped".to_string(),
                message: format!("Cluster {} is being torn down", cluster_name),
            }),
            Err(e) => Ok(StopOutcome {
                cluster_name: cluster_name.to_string(),
                status: "error".to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn get_cluster_status(&self, cluster_name: &str) -> ProviderResult<ClusterStatus> {
        let clusters = match self.fetch_clusters(Some(&[cluster_name])) {
            Ok(clusters) => clusters,
            Err(e) => {
                return Ok(ClusterStatus::unknown(
                    cluster_name,
                    &format!("Status query failed: {}", e),
                ))
            }
        };

        Ok(clusters
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(cluster_name))
            .map(Self::cluster_to_status)
            .unwrap_or_else(|| ClusterStatus::unknown(cluster_name, "Cluster not found")))
    }

    fn list_clusters(&self) -> ProviderResult<Vec<ClusterStatus>> {
        Ok(self
            .fetch_clusters(None)?
            .iter()
            .map(Self::cluster_to_status)
            .collect())
    }

    /// Three views composed: cloud clusters, SSH node pools with
    /// recomputed GPU allocation, and enabled-but-unused clouds.
    fn get_clusters_detailed(&self) -> ProviderResult<Vec<ClusterDetail>> {
        let mut all = Vec::new();

        let mut ssh_clusters_by_pool: HashMap<String, Vec<ClusterStatus>> = HashMap::new();
        let mut cloud_clusters = Vec::new();

        match self.list_clusters() {
            Ok(clusters) => {
                for status in clusters {
                    let cloud = status
                        .provider_data
                        .get("cloud")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_lowercase();
                    if cloud == "ssh" {
                        // region carries the SSH context, e.g. "ssh-homelab"
                        if let Some(pool) = status
                            .provider_data
                            .get("region")
                            .and_then(Value::as_str)
                            .and_then(|r| r.strip_prefix("ssh-"))
                        {
                            ssh_clusters_by_pool
                                .entry(pool.to_string())
                                .or_default()
                                .push(status);
                        }
                        continue;
                    }
                    cloud_clusters.push(status);
                }
            }
            Err(e) => warn!("Failed to list clusters: {}", e),
        }

        let mut active_clouds: BTreeSet<String> = BTreeSet::new();

        for status in cloud_clusters {
            let cluster_name = status.cluster_name.clone();
            let resources = self.get_cluster_resources(&cluster_name)?;
            let num_nodes = resources.num_nodes.unwrap_or(1).max(1);

            let mut gpus = BTreeMap::new();
            for gpu in &resources.gpus {
                gpus.insert(gpu.gpu.clone(), gpu.count);
            }

            let is_up = matches!(status.state, ClusterState::Up | ClusterState::Init);
            let running_jobs = self.running_jobs(&cluster_name);
            let has_running_jobs = !running_jobs.is_empty();

            if let Some(cloud) = status.provider_data.get("cloud").and_then(Value::as_str) {
                active_clouds.insert(cloud.to_lowercase());
            }

            let mut nodes = Vec::new();
            for i in 0..num_nodes {
                let node_name = if num_nodes > 1 {
                    format!("{}-node-{}", cluster_name, i + 1)
                } else {
                    cluster_name.clone()
                };
                let head = i == 0;

                let state = if !is_up {
                    status.state.to_string()
                } else if has_running_jobs {
                    "ALLOCATED".to_string()
                } else {
                    "IDLE".to_string()
                };
                let reason = if has_running_jobs && head {
                    format!(
                        "Running: {}",
                        running_jobs
                            .iter()
                            .take(3)
                            .map(|j| j
                                .job_name
                                .clone()
                                .unwrap_or_else(|| format!("job-{}", j.job_id)))
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                } else {
                    status.status_message.clone().unwrap_or_else(|| state.clone())
                };

                let allocated = has_running_jobs && head;
                nodes.push(NodeDetail {
                    node_name,
                    is_fixed: false,
                    is_active: is_up && has_running_jobs,
                    state,
                    reason: Some(reason),
                    resources: NodeResources {
                        cpus_total: resources.cpus.unwrap_or(0) as f64,
                        cpus_allocated: if allocated {
                            resources.cpus.unwrap_or(0) as f64
                        } else {
                            0.0
                        },
                        gpus_free: if allocated {
                            BTreeMap::new()
                        } else {
                            gpus.clone()
                        },
                        gpus: gpus.clone(),
                        memory_gb_total: resources.memory_gb.unwrap_or(0.0),
                        memory_gb_allocated: if allocated {
                            resources.memory_gb.unwrap_or(0.0)
                        } else {
                            0.0
                        },
                    },
                });
            }

            all.push(ClusterDetail {
                cluster_id: cluster_name.clone(),
                cluster_name,
                backend_type: "SkyPilot".to_string(),
                elastic_enabled: true,
                max_nodes: num_nodes,
                head_node_ip: status
                    .provider_data
                    .get("head_ip")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                nodes,
            });
        }

        match self.ssh_pool_details(&ssh_clusters_by_pool) {
            Ok(mut details) => all.append(&mut details),
            Err(e) => warn!("Failed to get SSH pools: {}", e),
        }

        // Clouds this control plane has served clusters on, currently
        // without one
        if let Ok(seen) = self.seen_clouds.lock() {
            for cloud in seen.iter() {
                if cloud.contains("ssh") || active_clouds.contains(cloud) {
                    continue;
                }
                all.push(ClusterDetail {
                    cluster_id: format!("{}-available", cloud),
                    cluster_name: cloud.to_uppercase(),
                    backend_type: "SkyPilot".to_string(),
                    elastic_enabled: true,
                    max_nodes: 0,
                    head_node_ip: None,
                    nodes: Vec::new(),
                });
            }
        }

        Ok(all)
    }

    fn get_cluster_resources(&self, cluster_name: &str) -> ProviderResult<ResourceInfo> {
        let status = self.get_cluster_status(cluster_name)?;
        let resources_str = status
            .provider_data
            .get("resources_str_full")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .or_else(|| status.resources_str.clone())
            .unwrap_or_default();

        let mut info = parse_resources_str(cluster_name, &resources_str);
        if info.num_nodes.is_none() {
            info.num_nodes = status.num_nodes.or(Some(1));
        }
        if info.cpus.is_none() {
            info.cpus = status
                .provider_data
                .get("cpus")
                .and_then(as_string)
                .and_then(|c| c.parse::<f64>().ok())
                .map(|c| c as u32);
        }
        info.provider_data = status.provider_data;
        info.provider_data
            .insert("resources_str".to_string(), json!(resources_str));
        Ok(info)
    }

    fn submit_job(&self, cluster_name: &str, config: &JobConfig) -> ProviderResult<SubmitOutcome> {
        let dag = Self::build_task_dag(
            config.job_name.as_deref().unwrap_or(cluster_name),
            Some(&config.command),
            None,
            &config.env_vars,
            &Default::default(),
            config.num_nodes,
            None,
        )?;

        let mut body: Map<String, Value> = Default::default();
        body.insert("task".to_string(), json!(dag));
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert("dryrun".to_string(), json!(false));
        body.insert("down".to_string(), json!(false));
        body.insert("backend".to_string(), Value::Null);

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/exec",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;

        Ok(SubmitOutcome {
            cluster_name: cluster_name.to_string(),
            job_id: None,
            request_id: Some(request_id),
        })
    }

    /// POST /logs as a streaming response. With `follow` the caller
    /// gets a line iterator; otherwise all lines are collected.
    fn get_job_logs(
        &self,
        cluster_name: &str,
        job_id: &str,
        tail_lines: Option<usize>,
        follow: bool,
    ) -> ProviderResult<LogOutput> {
        let mut body: Map<String, Value> = Default::default();
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert(
            "job_id".to_string(),
            match job_id.parse::<i64>() {
                Ok(n) => json!(n),
                Err(_) => json!(job_id),
            },
        );
        body.insert("follow".to_string(), json!(follow));
        body.insert("tail".to_string(), json!(tail_lines.unwrap_or(0)));

        let response = self.request(
            &self.stream,
            reqwest::Method::POST,
            "/logs",
            Some(self.envelope(body)),
        )?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ProviderError::from_http(
                "fetching logs",
                Some(status.as_u16()),
                &text,
            ));
        }

        let reader = std::io::BufReader::new(response);
        if follow {
            Ok(LogOutput::Stream(Box::new(reader.lines())))
        } else {
            let lines: Vec<String> = reader.lines().map_while(|l| l.ok()).collect();
            Ok(LogOutput::Full(lines.join("\n")))
        }
    }

    fn cancel_job(&self, cluster_name: &str, job_id: &str) -> ProviderResult<CancelOutcome> {
        let mut body: Map<String, Value> = Default::default();
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert(
            "job_ids".to_string(),
            match job_id.parse::<i64>() {
                Ok(n) => json!([n]),
                Err(_) => json!([job_id]),
            },
        );
        body.insert("all".to_string(), json!(false));

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/cancel",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;
        self.wait_request(&request_id)?;

        Ok(CancelOutcome {
            job_id: job_id.to_string(),
            status: "cancelled".to_string(),
        })
    }

    fn list_jobs(&self, cluster_name: &str) -> ProviderResult<Vec<JobInfo>> {
        let mut body: Map<String, Value> = Default::default();
        body.insert("cluster_name".to_string(), json!(cluster_name));
        body.insert("skip_finished".to_string(), json!(false));
        body.insert("all_users".to_string(), json!(true));

        let response = self.request(
            &self.control,
            reqwest::Method::POST,
            "/queue",
            Some(self.envelope(body)),
        )?;
        let request_id = Self::request_id(response)?;
        let result = self.wait_request(&request_id)?;

        let entries = match result {
            Value::Array(items) => items,
            Value::Object(mut map) => map
                .remove("jobs")
                .and_then(|j| j.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let job_id = entry.get("job_id").and_then(|v| as_string(v))?;
                let raw_state = entry
                    .get("status")
                    .and_then(|v| as_string(v))
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                Some(JobInfo {
                    job_id,
                    job_name: entry
                        .get("job_name")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    state: map_job_state(&raw_state),
                    cluster_name: cluster_name.to_string(),
                    command: entry
                        .get("run")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    submitted_at: entry.get("submitted_at").and_then(|v| as_string(v)),
                    started_at: entry.get("start_at").and_then(|v| as_string(v)),
                    finished_at: entry.get("end_at").and_then(|v| as_string(v)),
                    exit_code: None,
                    error_message: None,
                    provider_data: entry.as_object().cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    /// `GET /api/health` must answer `{"status": "healthy"}`.
    fn check(&self) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_CHECK_TIMEOUT_SECS))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };

        match self.request(&client, reqwest::Method::GET, "/api/health", None) {
            Ok(response) => response
                .json::<Value>()
                .ok()
                .and_then(|v| v.get("status").and_then(Value::as_str).map(|s| s == "healthy"))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_str_grammar() {
        let info = parse_resources_str(
            "c",
            "1x(gpus=RTX3090:1, cpus=4, mem=16, 4CPU--16GB--RTX3090:1, disk=256)",
        );
        assert_eq!(info.num_nodes, Some(1));
        assert_eq!(
            info.gpus,
            vec![GpuInfo {
                gpu: "RTX3090".to_string(),
                count: 1
            }]
        );
        assert_eq!(info.cpus, Some(4));
        assert_eq!(info.memory_gb, Some(16.0));
        assert_eq!(info.disk_gb, Some(256));
    }

    #[test]
    fn resources_str_without_gpus() {
        let info = parse_resources_str("c", "2x(cpus=8, mem=32, disk=100)");
        assert_eq!(info.num_nodes, Some(2));
        assert!(info.gpus.is_empty());
        assert_eq!(info.cpus, Some(8));
    }

    #[test]
    fn cluster_state_mapping_tolerates_enum_reprs() {
        assert_eq!(map_cluster_state("UP"), ClusterState::Up);
        assert_eq!(map_cluster_state("ClusterStatus.INIT"), ClusterState::Init);
        assert_eq!(map_cluster_state("weird"), ClusterState::Unknown);
    }

    #[test]
    fn job_state_mapping() {
        assert_eq!(map_job_state("JobStatus.SUCCEEDED"), JobState::Completed);
        assert_eq!(map_job_state("SETTING_UP"), JobState::Pending);
        assert_eq!(map_job_state("FAILED_SETUP"), JobState::Failed);
    }

    #[test]
    fn task_dag_contains_header_and_resources() {
        let dag = SkypilotProvider::build_task_dag(
            "train-1",
            Some("python train.py"),
            Some("pip install -e ."),
            &[("A".to_string(), "b".to_string())].into(),
            &Default::default(),
            Some(2),
            Some(json!({"accelerators": "A100:1"})),
        )
        .unwrap();

        assert!(dag.starts_with("name: train-1\n---\n"));
        assert!(dag.contains("run: python train.py"));
        assert!(dag.contains("setup: pip install -e ."));
        assert!(dag.contains("num_nodes: 2"));
        assert!(dag.contains("accelerators: A100:1"));
    }
}
