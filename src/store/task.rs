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

use crate::storage::Workspace;
use crate::store::named::NamedResource;

/// A stored task definition (the unit a workflow node references).
pub struct Task {
    inner: NamedResource,
}

impl Task {
    fn handle(ws: &Workspace, id: &str) -> Task {
        Task {
            inner: NamedResource::handle(ws, "Task", &ws.tasks_dir(), id),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Task> {
        let task = Self::handle(ws, id);
        task.inner.create().await?;
        Ok(task)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Task> {
        let task = Self::handle(ws, id);
        task.inner.open().await?;
        Ok(task)
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn resource(&self) -> &NamedResource {
        &self.inner
    }

    pub async fn delete(self) -> Result<()> {
        self.inner.delete().await
    }
}
