//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Workflows and workflow runs.
//!
//! A workflow is a directed graph of START and TASK nodes stored as a
//! JSON document; a run records the traversal state: current nodes,
//! spawned jobs, per-node metadata.

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::storage::{self, Workspace};
use crate::store::resource::ResourceDir;
use crate::util::slug::safe_filename;

pub const WORKFLOW_NOT_FOUND_ERROR: &str =
    "Workflow not found or does not belong to this experiment";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "TASK")]
    Task,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    /// Name of the stored task this node executes
    #[serde(default)]
    pub task: Option<String>,
    /// Declared inputs, as a JSON-encoded object
    #[serde(default)]
    pub inputs: Option<String>,
    /// Declared outputs, as a JSON-encoded object
    #[serde(default)]
    pub outputs: Option<String>,
    /// Task type override carried on the node itself
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub out: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl WorkflowConfig {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_by_ids(&self, ids: &[String]) -> Vec<&Node> {
        ids.iter().filter_map(|id| self.node(id)).collect()
    }

    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect()
    }
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
pub enum WorkflowRunStatus {
    #[display("CREATED")]
    #[serde(rename = "CREATED")]
    Created,
    #[display("QUEUED")]
    #[serde(rename = "QUEUED")]
    Queued,
    #[display("RUNNING")]
    #[serde(rename = "RUNNING")]
    Running,
    #[display("COMPLETE")]
    #[serde(rename = "COMPLETE")]
    Complete,
    #[display("FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
    #[display("CANCELLED")]
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

pub struct Workflow {
    id: String,
    res: ResourceDir,
}

impl Workflow {
    fn handle(ws: &Workspace, id: &str) -> Workflow {
        let dir = storage::join(&ws.workflows_dir(), &[&safe_filename(id)]);
        Workflow {
            id: id.to_string(),
            res: ResourceDir::new(ws.storage().clone(), dir),
        }
    }

    pub async fn create(
        ws: &Workspace,
        id: &str,
        name: &str,
        experiment_id: &str,
        config: &WorkflowConfig,
    ) -> Result<Workflow> {
        let workflow = Self::handle(ws, id);
        let document = json!({
            "id": id,
            "name": name,
            "experiment_id": experiment_id,
            "config": serde_json::to_value(config)?,
        });
        workflow.res.initialize("Workflow", id, &document).await?;
        Ok(workflow)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Workflow> {
        let workflow = Self::handle(ws, id);
        workflow
            .res
            .open_existing("Workflow", id, &json!({ "id": id }))
            .await?;
        Ok(workflow)
    }

    /// Fetch a workflow only when it belongs to the given experiment.
    /// Ownership mismatches and missing workflows read the same.
    pub async fn get_owned(
        ws: &Workspace,
        id: &str,
        experiment_id: &str,
    ) -> Result<Option<Workflow>> {
        let workflow = match Self::get(ws, id).await {
            Ok(w) => w,
            Err(_) => return Ok(None),
        };
        if workflow.experiment_id().await? != experiment_id {
            return Ok(None);
        }
        Ok(Some(workflow))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn experiment_id(&self) -> Result<String> {
        Ok(self
            .res
            .get_field("experiment_id")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    pub async fn config(&self) -> Result<WorkflowConfig> {
        let value = self.res.get_field("config").await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn set_config(&self, config: &WorkflowConfig) -> Result<()> {
        self.res
            .update_field("config", serde_json::to_value(config)?)
            .await
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.res.update_field("name", json!(name)).await
    }

    pub async fn delete(self) -> Result<()> {
        self.res.delete().await
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRunDocument {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub experiment_id: String,
    pub status: WorkflowRunStatus,
    #[serde(default)]
    pub current_tasks: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub node_metadata: Map<String, Value>,
}

pub struct WorkflowRun {
    id: String,
    res: ResourceDir,
}

impl WorkflowRun {
    fn handle(ws: &Workspace, id: &str) -> WorkflowRun {
        let dir = storage::join(&ws.workflow_runs_dir(), &[&safe_filename(id)]);
        WorkflowRun {
            id: id.to_string(),
            res: ResourceDir::new(ws.storage().clone(), dir),
        }
    }

    pub async fn create(
        ws: &Workspace,
        workflow_id: &str,
        experiment_id: &str,
    ) -> Result<WorkflowRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let run = Self::handle(ws, &id);
        let document = json!({
            "id": id,
            "workflow_id": workflow_id,
            "experiment_id": experiment_id,
            "status": "QUEUED",
            "current_tasks": [],
            "jobs": [],
            "node_metadata": {},
        });
        run.res.initialize("WorkflowRun", &id, &document).await?;
        Ok(run)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<WorkflowRun> {
        let run = Self::handle(ws, id);
        run.res
            .open_existing("WorkflowRun", id, &json!({ "id": id }))
            .await?;
        Ok(run)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn document(&self) -> Result<WorkflowRunDocument> {
        let value = self.res.json_data().await?;
        serde_json::from_value(value.clone()).map_err(|e| {
            anyhow::anyhow!("Workflow run {} has an invalid document: {}", self.id, e)
        })
    }

    pub async fn set_status(&self, status: WorkflowRunStatus) -> Result<()> {
        self.res
            .update_field("status", json!(status.to_string()))
            .await
    }

    pub async fn set_current_tasks(&self, tasks: &[String]) -> Result<()> {
        self.res.update_field("current_tasks", json!(tasks)).await
    }

    pub async fn append_jobs(&self, job_ids: &[String]) -> Result<()> {
        let mut doc = self.document().await?;
        doc.jobs.extend(job_ids.iter().cloned());
        self.res.update_field("jobs", json!(doc.jobs)).await
    }

    pub async fn update_node_metadata(&self, node_id: &str, metadata: Value) -> Result<()> {
        let mut doc = self.document().await?;
        doc.node_metadata.insert(node_id.to_string(), metadata);
        self.res
            .update_field("node_metadata", Value::Object(doc.node_metadata))
            .await
    }
}
