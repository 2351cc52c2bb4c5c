//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Runpod-style pod provider: single-node GPU/CPU pods via a REST API.
//!
//! Pods are addressed by id while the provider contract addresses them
//! by name, so a name-to-id cache is maintained and refreshed on every
//! listing. Job submission, job logs and job cancellation have no API
//! counterpart; consumers fall back to the dashboard.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
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

const DEFAULT_API_BASE_URL: &str = "https://rest.runpod.io/v1";
const DEFAULT_GPU_IMAGE: &str = "runpod/pytorch:2.1.0-py3.10-cuda11.8.0-devel-ubuntu22.04";
const DEFAULT_CPU_IMAGE: &str = "ubuntu:22.04";

lazy_static::lazy_static! {
    /// Abbreviation -> full provider GPU name. The live `/gpu-types`
    /// listing can override these at call time.
    static ref GPU_NAME_MAP: HashMap<&'static str, &'static str> = HashMap::from([
        ("RTX3090", "NVIDIA GeForce RTX 3090"),
        ("RTX3080", "NVIDIA GeForce RTX 3080"),
        ("RTX3070", "NVIDIA GeForce RTX 3070"),
        ("RTX4090", "NVIDIA GeForce RTX 4090"),
        ("RTX4080", "NVIDIA GeForce RTX 4080"),
        ("RTX4070TI", "NVIDIA GeForce RTX 4070 Ti"),
        ("RTX3080TI", "NVIDIA GeForce RTX 3080 Ti"),
        ("RTX3090TI", "NVIDIA GeForce RTX 3090 Ti"),
        ("RTX5080", "NVIDIA GeForce RTX 5080"),
        ("RTX5090", "NVIDIA GeForce RTX 5090"),
        ("A100", "NVIDIA A100-SXM4-80GB"),
        ("A100-80GB", "NVIDIA A100-SXM4-80GB"),
        ("A100-PCIE", "NVIDIA A100 80GB PCIe"),
        ("A40", "NVIDIA A40"),
        ("A30", "NVIDIA A30"),
        ("A5000", "NVIDIA RTX A5000"),
        ("A4500", "NVIDIA RTX A4500"),
        ("A4000", "NVIDIA RTX A4000"),
        ("A6000", "NVIDIA RTX A6000"),
        ("A2000", "NVIDIA RTX A2000"),
        ("L40", "NVIDIA L40"),
        ("L40S", "NVIDIA L40S"),
        ("L4", "NVIDIA L4"),
        ("H100", "NVIDIA H100 80GB HBM3"),
        ("H100-PCIE", "NVIDIA H100 PCIe"),
        ("H100-NVL", "NVIDIA H100 NVL"),
        ("H200", "NVIDIA H200"),
        ("H200-NVL", "NVIDIA H200 NVL"),
        ("V100", "Tesla V100-PCIE-16GB"),
        ("V100-16GB", "Tesla V100-PCIE-16GB"),
        ("V100-32GB", "Tesla V100-PCIE-32GB"),
        ("T4", "Tesla T4"),
        ("RTX6000", "NVIDIA RTX 6000 Ada Generation"),
        ("RTX5000", "NVIDIA RTX 5000 Ada Generation"),
        ("RTX4000", "NVIDIA RTX 4000 Ada Generation"),
        ("RTX2000", "NVIDIA RTX 2000 Ada Generation"),
    ]);
}

fn map_pod_status(status: &str) -> ClusterState {
    match status.to_uppercase().as_str() {
        "RUNNING" => ClusterState::Up,
        "STOPPED" => ClusterState::Stopped,
        "TERMINATED" => ClusterState::Down,
        "CREATING" | "RESTARTING" => ClusterState::Init,
        "FAILED" => ClusterState::Failed,
        _ => ClusterState::Unknown,
    }
}

/// Listings come back either as a bare array or wrapped in `{"data": []}`.
fn unwrap_listing(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => map
            .remove("data")
            .and_then(|d| d.as_array().cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_memory_gb(memory: &str) -> Option<f64> {
    let upper = memory.trim().to_uppercase();
    if let Some(gb) = upper.strip_suffix("GB") {
        gb.trim().parse().ok()
    } else if let Some(mb) = upper.strip_suffix("MB") {
        mb.trim().parse::<f64>().ok().map(|m| m / 1024.0)
    } else {
        upper.parse().ok()
    }
}

#[derive(Debug)]
pub struct RunpodProvider {
    api_key: String,
    api_base_url: String,
    default_gpu_type: Option<String>,
    default_region: Option<String>,
    default_template_id: Option<String>,
    default_network_volume_id: Option<String>,
    default_volume_gb: Option<u64>,
    http: reqwest::blocking::Client,
    pod_id_cache: Mutex<HashMap<String, String>>,
}

impl RunpodProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api_key: String,
        api_base_url: Option<String>,
        default_gpu_type: Option<String>,
        default_region: Option<String>,
        default_template_id: Option<String>,
        default_network_volume_id: Option<String>,
        default_volume_gb: Option<u64>,
    ) -> RunpodProvider {
        RunpodProvider {
            api_key,
            api_base_url: api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_gpu_type,
            default_region,
            default_template_id,
            default_network_volume_id,
            default_volume_gb,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(PROVIDER_HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            pod_id_cache: Mutex::new(HashMap::new()),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> ProviderResult<Value> {
        let url = format!("{}{}", self.api_base_url, endpoint);
        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().map_err(|e| {
            ProviderError::from_http(&url, e.status().map(|s| s.as_u16()), &e.to_string())
        })?;
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

    fn cache_pod_id(&self, name: &str, id: &str) {
        if let Ok(mut cache) = self.pod_id_cache.lock() {
            cache.insert(name.to_string(), id.to_string());
        }
    }

    fn cached_pod_id(&self, name: &str) -> Option<String> {
        self.pod_id_cache.lock().ok()?.get(name).cloned()
    }

    fn evict_pod_id(&self, name: &str) {
        if let Ok(mut cache) = self.pod_id_cache.lock() {
            cache.remove(name);
        }
    }

    /// Find a pod by cluster name: try the cached id, then scan the
    /// listing and refresh the cache.
    fn find_pod_by_name(&self, cluster_name: &str) -> Option<Value> {
        if let Some(pod_id) = self.cached_pod_id(cluster_name) {
            match self.request(
                reqwest::Method::GET,
                &format!("/pods/{}", pod_id),
                None,
                None,
            ) {
                Ok(pod) => return Some(pod),
                Err(_) => self.evict_pod_id(cluster_name),
            }
        }

        let pods = match self.request(reqwest::Method::GET, "/pods", None, None) {
            Ok(value) => unwrap_listing(value),
            Err(e) => {
                warn!("Error searching for pod by name: {}", e);
                return None;
            }
        };

        for pod in pods {
            if pod.get("name").and_then(Value::as_str) == Some(cluster_name) {
                if let Some(id) = pod.get("id").and_then(Value::as_str) {
                    self.cache_pod_id(cluster_name, id);
                }
                return Some(pod);
            }
        }
        None
    }

    /// Map an accelerator spec to a provider GPU type id, via the static
    /// abbreviation table with a live override from `/gpu-types`.
    fn map_gpu_type(&self, accelerators: Option<&str>) -> Option<String> {
        let spec = match accelerators {
            Some(a) if !a.is_empty() => a,
            _ => return self.default_gpu_type.clone(),
        };

        let (gpu_type, _) = parse_accelerators(spec);
        let mapped = GPU_NAME_MAP
            .get(gpu_type.to_uppercase().as_str())
            .map(|full| full.to_string())
            .unwrap_or(gpu_type);

        if let Ok(types) = self.request(reqwest::Method::GET, "/gpu-types", None, None) {
            for gt in unwrap_listing(types) {
                let id = gt.get("id").and_then(Value::as_str);
                let name = gt.get("name").and_then(Value::as_str);
                if id == Some(mapped.as_str()) || name == Some(mapped.as_str()) {
                    return id.map(|s| s.to_string());
                }
            }
        }

        // The mapped value may itself be a valid id
        Some(mapped)
    }

    fn pod_to_status(&self, pod: &Value) -> ClusterStatus {
        let name = pod
            .get("name")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                format!(
                    "pod-{}",
                    pod.get("id").and_then(Value::as_str).unwrap_or("unknown")
                )
            });
        let raw_status = pod
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN");

        if let Some(id) = pod.get("id").and_then(Value::as_str) {
            self.cache_pod_id(&name, id);
        }

        let resources_str = pod
            .get("gpuTypeId")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .or_else(|| {
                pod.get("gpuType")
                    .and_then(|t| t.get("name"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            });

        ClusterStatus {
            cluster_name: name,
            state: map_pod_status(raw_status),
            status_message: Some(raw_status.to_string()),
            launched_at: pod
                .get("createdAt")
                .or_else(|| pod.get("created_at"))
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            last_use: pod
                .get("lastUsedAt")
                .or_else(|| pod.get("last_used_at"))
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            autostop: None,
            num_nodes: Some(1),
            resources_str,
            provider_data: pod.as_object().cloned().unwrap_or_default(),
        }
    }
}

impl ComputeProvider for RunpodProvider {
    /// Create a pod. Accelerators select a GPU pod; otherwise a CPU pod
    /// with the configured vCPU/memory counts. Setup and command are
    /// joined into a single `sh -c` start command so compound commands
    /// survive the container entrypoint.
    fn launch_cluster(
        &self,
        cluster_name: &str,
        config: &ClusterConfig,
    ) -> ProviderResult<LaunchOutcome> {
        let mut pod: Map<String, Value> = Default::default();
        pod.insert("name".to_string(), json!(cluster_name));

        let (compute_type, default_image) = if config.accelerators.is_some() {
            ("GPU", DEFAULT_GPU_IMAGE)
        } else {
            ("CPU", DEFAULT_CPU_IMAGE)
        };
        pod.insert("computeType".to_string(), json!(compute_type));

        let image = config
            .provider_config
            .template_id
            .clone()
            .or_else(|| self.default_template_id.clone())
            .unwrap_or_else(|| default_image.to_string());
        pod.insert("imageName".to_string(), json!(image));

        if compute_type == "GPU" {
            let accelerators = config.accelerators.as_deref();
            let gpu_type_id = self.map_gpu_type(accelerators).ok_or_else(|| {
                ProviderError::Launch(
                    "GPU type is required. Specify accelerators or set default_gpu_type in provider config."
                        .into(),
                )
            })?;
            let (_, gpu_count) = parse_accelerators(accelerators.unwrap_or_default());
            pod.insert("gpuTypeIds".to_string(), json!([gpu_type_id]));
            pod.insert("gpuCount".to_string(), json!(gpu_count));
        } else {
            let vcpus = config
                .cpus
                .as_deref()
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(2);
            pod.insert("vcpuCount".to_string(), json!(vcpus));
            if let Some(memory_gb) = config.memory.as_deref().and_then(parse_memory_gb) {
                pod.insert("memoryInGb".to_string(), json!(memory_gb));
            }
        }

        if let Some(disk) = config.disk_size.or(self.default_volume_gb) {
            pod.insert("volumeInGb".to_string(), json!(disk));
        }
        if let Some(container_disk) = config.provider_config.container_disk_gb {
            pod.insert("containerDiskInGb".to_string(), json!(container_disk));
        }
        if !config.env_vars.is_empty() {
            pod.insert("env".to_string(), json!(config.env_vars));
        }
        if let Some(volume_id) = config
            .provider_config
            .network_volume_id
            .clone()
            .or_else(|| self.default_network_volume_id.clone())
        {
            pod.insert("networkVolumeId".to_string(), json!(volume_id));
        }

        let commands: Vec<&str> = [config.setup.as_deref(), config.command.as_deref()]
            .into_iter()
            .flatten()
            .filter(|c| !c.trim().is_empty())
            .collect();
        if !commands.is_empty() {
            pod.insert(
                "dockerStartCmd".to_string(),
                json!(["sh", "-c", commands.join(" && ")]),
            );
        }

        if let Some(region) = config.region.clone().or_else(|| self.default_region.clone()) {
            pod.insert("region".to_string(), json!(region));
        }

        debug!("Creating pod {} ({})", cluster_name, compute_type);
        let result = self
            .request(
                reqwest::Method::POST,
                "/pods",
                Some(&Value::Object(pod)),
                None,
            )
            .map_err(|e| ProviderError::Launch(format!("Failed to create pod: {}", e)))?;

        let pod_id = result
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .or_else(|| {
                result
                    .get("pod")
                    .and_then(|p| p.get("id"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            })
            .or_else(|| result.as_str().map(|s| s.to_string()));

        if let Some(id) = &pod_id {
            self.cache_pod_id(cluster_name, id);
        }

        Ok(LaunchOutcome {
            cluster_name: cluster_name.to_string(),
            job_id: None,
            pid: None,
            request_id: pod_id,
            status: "submitted".to_string(),
            message: "Pod created".to_string(),
        })
    }

    /// Terminate the pod. Unknown pods stop with an error message rather
    /// than a hard failure so stop stays idempotent.
    fn stop_cluster(&self, cluster_name: &str) -> ProviderResult<StopOutcome> {
        let pod = match self.find_pod_by_name(cluster_name) {
            Some(pod) => pod,
            None => {
                return Ok(StopOutcome {
                    cluster_name: cluster_name.to_string(),
                    status: "error".to_string(),
                    message: format!("Pod with name '{}' not found", cluster_name),
                })
            }
        };

        let pod_id = match pod.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                return Ok(StopOutcome {
                    cluster_name: cluster_name.to_string(),
                    status: "error".to_string(),
                    message: format!("Pod '{}' has no ID", cluster_name),
                })
            }
        };

        match self.request(
            reqwest::Method::DELETE,
            &format!("/pods/{}", pod_id),
            None,
            None,
        ) {
            Ok(_) => {
                self.evict_pod_id(cluster_name);
                Ok(StopOutcome {
                    cluster_name: cluster_name.to_string(),
                    status: "success".to_string(),
                    message: format!("Pod '{}' terminated successfully", cluster_name),
                })
            }
            Err(e) => Ok(StopOutcome {
                cluster_name: cluster_name.to_string(),
                status: "error".to_string(),
                message: format!("Failed to terminate pod: {}", e),
            }),
        }
    }

    fn get_cluster_status(&self, cluster_name: &str) -> ProviderResult<ClusterStatus> {
        match self.find_pod_by_name(cluster_name) {
            Some(pod) => Ok(self.pod_to_status(&pod)),
            None => Ok(ClusterStatus::unknown(cluster_name, "Pod not found")),
        }
    }

    fn list_clusters(&self) -> ProviderResult<Vec<ClusterStatus>> {
        let pods = match self.request(reqwest::Method::GET, "/pods", None, None) {
            Ok(value) => unwrap_listing(value),
            Err(e) => {
                warn!("Error listing pods: {}", e);
                return Ok(Vec::new());
            }
        };
        Ok(pods.iter().map(|pod| self.pod_to_status(pod)).collect())
    }

    fn get_clusters_detailed(&self) -> ProviderResult<Vec<ClusterDetail>> {
        let mut detailed = Vec::new();
        for status in self.list_clusters()? {
            let resources = self.get_cluster_resources(&status.cluster_name)?;

            let mut gpus = BTreeMap::new();
            for gpu in &resources.gpus {
                gpus.insert(gpu.gpu.clone(), gpu.count);
            }
            let is_up = matches!(status.state, ClusterState::Up | ClusterState::Init);

            let node = NodeDetail {
                node_name: status.cluster_name.clone(),
                is_fixed: false,
                is_active: is_up,
                state: status.state.to_string(),
                reason: status.status_message.clone(),
                resources: NodeResources {
                    cpus_total: resources.cpus.unwrap_or(0) as f64,
                    cpus_allocated: if is_up {
                        resources.cpus.unwrap_or(0) as f64
                    } else {
                        0.0
                    },
                    gpus_free: if is_up { BTreeMap::new() } else { gpus.clone() },
                    gpus,
                    memory_gb_total: resources.memory_gb.unwrap_or(0.0),
                    memory_gb_allocated: if is_up {
                        resources.memory_gb.unwrap_or(0.0)
                    } else {
                        0.0
                    },
                },
            };

            detailed.push(ClusterDetail {
                cluster_id: status.cluster_name.clone(),
                cluster_name: status.cluster_name.clone(),
                backend_type: "Runpod".to_string(),
                elastic_enabled: true,
                max_nodes: 1,
                head_node_ip: status
                    .provider_data
                    .get("runtime")
                    .and_then(|r| r.get("publicIp"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                nodes: vec![node],
            });
        }
        Ok(detailed)
    }

    fn get_cluster_resources(&self, cluster_name: &str) -> ProviderResult<ResourceInfo> {
        let pod = match self.find_pod_by_name(cluster_name) {
            Some(pod) => pod,
            None => {
                return Ok(ResourceInfo {
                    cluster_name: cluster_name.to_string(),
                    num_nodes: Some(1),
                    ..Default::default()
                })
            }
        };

        let mut gpus = Vec::new();
        match pod.get("gpuTypeId") {
            Some(Value::String(gpu)) => gpus.push(GpuInfo {
                gpu: gpu.clone(),
                count: 1,
            }),
            _ => {
                if let Some(gpu_type) = pod.get("gpuType").and_then(Value::as_object) {
                    if let Some(name) = gpu_type.get("name").and_then(Value::as_str) {
                        gpus.push(GpuInfo {
                            gpu: name.to_string(),
                            count: gpu_type
                                .get("count")
                                .and_then(Value::as_u64)
                                .unwrap_or(1) as u32,
                        });
                    }
                }
            }
        }

        Ok(ResourceInfo {
            cluster_name: cluster_name.to_string(),
            gpus,
            cpus: pod.get("cpus").and_then(Value::as_u64).map(|c| c as u32),
            memory_gb: pod
                .get("memoryInGb")
                .or_else(|| pod.get("memoryInGB"))
                .and_then(Value::as_f64),
            disk_gb: pod
                .get("volumeInGb")
                .or_else(|| pod.get("volumeInGB"))
                .and_then(Value::as_u64),
            num_nodes: Some(1),
            provider_data: pod.as_object().cloned().unwrap_or_default(),
        })
    }

    fn submit_job(&self, _cluster_name: &str, _config: &JobConfig) -> ProviderResult<SubmitOutcome> {
        Err(ProviderError::Unsupported(
            "pod backend has no job submission endpoint",
        ))
    }

    fn get_job_logs(
        &self,
        _cluster_name: &str,
        _job_id: &str,
        _tail_lines: Option<usize>,
        _follow: bool,
    ) -> ProviderResult<LogOutput> {
        Ok(LogOutput::Full(
            "Logs not available via pod API. Use the provider console.".to_string(),
        ))
    }

    fn cancel_job(&self, _cluster_name: &str, _job_id: &str) -> ProviderResult<CancelOutcome> {
        Err(ProviderError::Unsupported(
            "pod backend has no job cancellation endpoint",
        ))
    }

    fn list_jobs(&self, _cluster_name: &str) -> ProviderResult<Vec<JobInfo>> {
        Err(ProviderError::Unsupported(
            "pod backend has no job queue system",
        ))
    }

    /// A cheap listing call verifies both reachability and the API key.
    fn check(&self) -> bool {
        match self.request(
            reqwest::Method::GET,
            "/pods",
            None,
            Some(Duration::from_secs(PROVIDER_CHECK_TIMEOUT_SECS)),
        ) {
            Ok(_) => true,
            Err(e) => {
                warn!("Pod provider check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_status_mapping() {
        assert_eq!(map_pod_status("RUNNING"), ClusterState::Up);
        assert_eq!(map_pod_status("stopped"), ClusterState::Stopped);
        assert_eq!(map_pod_status("TERMINATED"), ClusterState::Down);
        assert_eq!(map_pod_status("CREATING"), ClusterState::Init);
        assert_eq!(map_pod_status("RESTARTING"), ClusterState::Init);
        assert_eq!(map_pod_status("FAILED"), ClusterState::Failed);
        assert_eq!(map_pod_status("whatever"), ClusterState::Unknown);
    }

    #[test]
    fn listing_unwraps_both_shapes() {
        assert_eq!(unwrap_listing(json!([1, 2])).len(), 2);
        assert_eq!(unwrap_listing(json!({"data": [1]})).len(), 1);
        assert_eq!(unwrap_listing(json!("x")).len(), 0);
    }

    #[test]
    fn memory_strings_parse() {
        assert_eq!(parse_memory_gb("4GB"), Some(4.0));
        assert_eq!(parse_memory_gb("2048MB"), Some(2.0));
        assert_eq!(parse_memory_gb("8"), Some(8.0));
        assert_eq!(parse_memory_gb("lots"), None);
    }

    #[test]
    fn gpu_abbreviations_resolve() {
        assert_eq!(
            GPU_NAME_MAP.get("A100").copied(),
            Some("NVIDIA A100-SXM4-80GB")
        );
        assert_eq!(GPU_NAME_MAP.get("T4").copied(), Some("Tesla T4"));
    }
}
