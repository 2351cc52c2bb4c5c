//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The uniform shape shared by datasets, models, tasks and templates: a
//! directory plus `index.json` of `{id, name, json_data}`.

use anyhow::Result;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::storage::{self, Workspace};
use crate::store::resource::ResourceDir;
use crate::util::slug::safe_filename;

pub struct NamedResource {
    id: String,
    kind: &'static str,
    res: ResourceDir,
}

impl NamedResource {
    pub fn resource_dir(parent_dir: &str, id: &str) -> String {
        storage::join(parent_dir, &[&safe_filename(id)])
    }

    pub(in crate::store) fn handle(
        ws: &Workspace,
        kind: &'static str,
        parent_dir: &str,
        id: &str,
    ) -> NamedResource {
        let dir = Self::resource_dir(parent_dir, id);
        NamedResource {
            id: id.to_string(),
            kind,
            res: ResourceDir::new(ws.storage().clone(), dir),
        }
    }

    fn default_document(&self) -> Value {
        json!({ "id": self.id, "name": self.id, "json_data": {} })
    }

    pub async fn create(&self) -> Result<()> {
        self.res
            .initialize(self.kind, &self.id, &self.default_document())
            .await
    }

    pub async fn open(&self) -> Result<()> {
        self.res
            .open_existing(self.kind, &self.id, &self.default_document())
            .await
    }

    pub async fn create_or_open(&self) -> Result<()> {
        if self.res.storage().isdir(self.res.dir()).await? {
            self.open().await
        } else {
            self.create().await
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &str {
        self.res.dir()
    }

    pub(in crate::store) fn resource(&self) -> &ResourceDir {
        &self.res
    }

    pub async fn document(&self) -> Result<Value> {
        self.res.json_data().await
    }

    pub async fn name(&self) -> Result<String> {
        Ok(self
            .res
            .get_field("name")
            .await?
            .as_str()
            .unwrap_or(&self.id)
            .to_string())
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.res.update_field("name", json!(name)).await
    }

    pub async fn json_data(&self) -> Result<Map<String, Value>> {
        Ok(self
            .res
            .get_field("json_data")
            .await?
            .as_object()
            .cloned()
            .unwrap_or_default())
    }

    pub async fn set_json_data(&self, json_data: Map<String, Value>) -> Result<()> {
        self.res
            .update_field("json_data", Value::Object(json_data))
            .await
    }

    pub async fn update_json_data_field(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.json_data().await?;
        data.insert(key.to_string(), value);
        self.set_json_data(data).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.res.delete().await
    }
}
