//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The compute provider bridge: a closed set of polymorphic backends
//! behind one contract.
//!
//! Provider methods are synchronous by design; concurrency belongs to
//! the dispatcher, which drives every call through a blocking task. A
//! provider must never assume it is the only caller, but launches onto
//! the local backend are serialized by the dispatcher's single-flight
//! rule, not by the provider.

pub mod error;
pub mod local;
pub mod models;
pub mod router;
pub mod runpod;
pub mod settings;
pub mod skypilot;
pub mod slurm;

#[allow(unused_imports)]
pub use error::ProviderError;
pub use error::ProviderResult;
pub use models::*;

/// Log retrieval result: the concatenated tail, or a line iterator when
/// following.
pub enum LogOutput {
    Full(String),
    Stream(Box<dyn Iterator<Item = std::io::Result<String>> + Send>),
}

impl LogOutput {
    /// Collect the output into one string, draining a stream if needed.
    pub fn into_string(self) -> String {
        match self {
            LogOutput::Full(s) => s,
            LogOutput::Stream(lines) => lines
                .filter_map(|l| l.ok())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

pub trait ComputeProvider: Send + Sync + std::fmt::Debug {
    /// Provision compute and start the configured command. For
    /// long-lived backends `cluster_name` names the cluster; for
    /// ephemeral backends it names the run.
    fn launch_cluster(
        &self,
        cluster_name: &str,
        config: &ClusterConfig,
    ) -> ProviderResult<LaunchOutcome>;

    /// Stop without tear-down where the backend distinguishes the two.
    /// Idempotent.
    fn stop_cluster(&self, cluster_name: &str) -> ProviderResult<StopOutcome>;

    /// Never fails for missing clusters; reports `UNKNOWN` instead.
    fn get_cluster_status(&self, cluster_name: &str) -> ProviderResult<ClusterStatus>;

    fn list_clusters(&self) -> ProviderResult<Vec<ClusterStatus>> {
        Ok(Vec::new())
    }

    /// Detailed per-node view for UIs.
    fn get_clusters_detailed(&self) -> ProviderResult<Vec<ClusterDetail>>;

    fn get_cluster_resources(&self, cluster_name: &str) -> ProviderResult<ResourceInfo>;

    /// Submit a job to an existing cluster. `Unsupported` for backends
    /// whose `launch_cluster` already runs the work.
    fn submit_job(&self, cluster_name: &str, config: &JobConfig) -> ProviderResult<SubmitOutcome>;

    fn get_job_logs(
        &self,
        cluster_name: &str,
        job_id: &str,
        tail_lines: Option<usize>,
        follow: bool,
    ) -> ProviderResult<LogOutput>;

    fn cancel_job(&self, cluster_name: &str, job_id: &str) -> ProviderResult<CancelOutcome>;

    fn list_jobs(&self, cluster_name: &str) -> ProviderResult<Vec<JobInfo>>;

    /// Lightweight liveness probe. Must not panic or hang; used by the
    /// router UI and as a dispatcher precondition.
    fn check(&self) -> bool;
}
