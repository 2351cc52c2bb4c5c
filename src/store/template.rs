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

/// A reusable job template.
pub struct Template {
    inner: NamedResource,
}

impl Template {
    fn handle(ws: &Workspace, id: &str) -> Template {
        Template {
            inner: NamedResource::handle(ws, "Template", &ws.templates_dir(), id),
        }
    }

    pub async fn create(ws: &Workspace, id: &str) -> Result<Template> {
        let template = Self::handle(ws, id);
        template.inner.create().await?;
        Ok(template)
    }

    pub async fn get(ws: &Workspace, id: &str) -> Result<Template> {
        let template = Self::handle(ws, id);
        template.inner.open().await?;
        Ok(template)
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
