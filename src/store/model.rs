//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::consts::PROVENANCE_JSON;
use crate::storage::{self, Workspace};
use crate::store::named::NamedResource;

/// A model registered in the workspace model zoo. `json_data` carries
/// `{uniqueID, architecture, pipeline_tag, huggingface_repo,
/// parent_model, description, source}`.
pub struct Model {
    ws: Workspace,
    inner: NamedResource,
}

/// Companion document recording how a model was produced.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub input_model: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub adaptor_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub md5_checksums: Vec<String>,
}

impl Model {
    fn handle(ws: &Workspace, id: &str) -> Model {
        Model {
            ws: ws.clone(),
            inner: NamedResource::handle(ws, "Model", &ws.models_dir(), id),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Model> {
        let model = Self::handle(ws, id);
        model.inner.create().await?;
        Ok(model)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Model> {
        let model = Self::handle(ws, id);
        model.inner.open().await?;
        Ok(model)
    }

    pub async fn create_or_get(ws: &Workspace, id: &str) -> Result<Model> {
        let model = Self::handle(ws, id);
        model.inner.create_or_open().await?;
        Ok(model)
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn dir(&self) -> &str {
        self.inner.dir()
    }

    pub fn resource(&self) -> &NamedResource {
        &self.inner
    }

    /// Write the model metadata so the model shows up in listings.
    /// `model_filename` is empty for directory-shaped models.
    pub async fn write_metadata(
        &self,
        architecture: &str,
        model_filename: &str,
        extra: Map<String, Value>,
    ) -> Result<()> {
        let mut data = self.inner.json_data().await?;
        data.insert("uniqueID".to_string(), json!(self.inner.id()));
        data.insert("architecture".to_string(), json!(architecture));
        if !model_filename.is_empty() {
            data.insert("model_filename".to_string(), json!(model_filename));
        }
        data.insert("source".to_string(), json!("workspace"));
        for (k, v) in extra {
            data.insert(k, v);
        }
        self.inner.set_json_data(data).await
    }

    pub async fn write_provenance(&self, provenance: &Provenance) -> Result<()> {
        let path = storage::join(self.inner.dir(), &[PROVENANCE_JSON]);
        self.ws
            .storage()
            .write(&path, serde_json::to_vec(provenance)?.as_slice())
            .await
    }

    pub async fn provenance(&self) -> Result<Option<Provenance>> {
        let path = storage::join(self.inner.dir(), &[PROVENANCE_JSON]);
        if !self.ws.storage().isfile(&path).await? {
            return Ok(None);
        }
        let content = self.ws.storage().read_to_string(&path).await?;
        Ok(serde_json::from_str(&content).ok())
    }

    pub async fn delete(self) -> Result<()> {
        self.inner.delete().await
    }
}
