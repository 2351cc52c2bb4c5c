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
use serde_json::json;

use crate::storage::Workspace;
use crate::store::named::NamedResource;

/// A dataset registered in the workspace. `json_data` carries
/// `{location, description, size, sample_count, files, generated}`.
pub struct Dataset {
    inner: NamedResource,
}

impl Dataset {
    fn handle(ws: &Workspace, id: &str) -> Dataset {
        Dataset {
            inner: NamedResource::handle(ws, "Dataset", &ws.datasets_dir(), id),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Dataset> {
        let ds = Self::handle(ws, id);
        ds.inner.create().await?;
        Ok(ds)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Dataset> {
        let ds = Self::handle(ws, id);
        ds.inner.open().await?;
        Ok(ds)
    }

    /// Register a dataset generated by a job: location points at the
    /// stored files, `generated` marks it as job output.
    pub async fn register_generated(
        ws: &Workspace,
        id: &str,
        location: &str,
        size: Option<u64>,
    ) -> Result<Dataset> {
        let ds = Self::handle(ws, id);
        ds.inner.create_or_open().await?;
        let mut data = ds.inner.json_data().await?;
        data.insert("location".to_string(), json!(location));
        data.insert("generated".to_string(), json!(true));
        if let Some(size) = size {
            data.insert("size".to_string(), json!(size));
        }
        ds.inner.set_json_data(data).await?;
        Ok(ds)
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

    pub async fn delete(self) -> Result<()> {
        self.inner.delete().await
    }
}
