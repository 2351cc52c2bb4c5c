//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Team-scoped compute provider records, stored like every other
//! resource: `providers/<name>/index.json`.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::consts::INDEX_JSON;
use crate::provider::settings::ProviderSettings;
use crate::storage::{self, Workspace};
use crate::util::slug::safe_filename;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub config: ProviderSettings,
}

impl ProviderRecord {
    fn record_file(ws: &Workspace, name: &str) -> String {
        storage::join(&ws.providers_dir(), &[&safe_filename(name), INDEX_JSON])
    }

    /// Look a provider record up by name. A missing or unreadable
    /// record reads as absent so callers can fall through to the YAML
    /// configuration.
    pub async fn find(ws: &Workspace, name: &str) -> Option<ProviderRecord> {
        let file = Self::record_file(ws, name);
        let content = ws.storage().read_to_string(&file).await.ok()?;
        serde_json::from_str(content.trim()).ok()
    }

    pub async fn save(&self, ws: &Workspace) -> Result<()> {
        let file = Self::record_file(ws, &self.name);
        let dir = storage::parent(&file).to_string();
        ws.storage()
            .makedirs(&dir)
            .await
            .with_context(|| anyhow!("Creating provider record directory {}", dir))?;
        ws.storage()
            .write(&file, serde_json::to_vec(self)?.as_slice())
            .await
            .with_context(|| anyhow!("Writing provider record {}", file))
    }

    /// All provider records of the workspace.
    pub async fn list(ws: &Workspace) -> Result<Vec<ProviderRecord>> {
        let mut records = Vec::new();
        for entry in ws
            .storage()
            .ls(&ws.providers_dir())
            .await
            .unwrap_or_default()
        {
            let file = storage::join(&entry, &[INDEX_JSON]);
            if let Ok(content) = ws.storage().read_to_string(&file).await {
                if let Ok(record) = serde_json::from_str::<ProviderRecord>(content.trim()) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    pub async fn delete(ws: &Workspace, name: &str) -> Result<()> {
        let dir = storage::join(&ws.providers_dir(), &[&safe_filename(name)]);
        ws.storage().rm_tree(&dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrgContext;

    fn test_workspace(tmp: &tempfile::TempDir) -> Workspace {
        let mut cfg = config::Config::default();
        cfg.set("compatibility", "*").unwrap();
        cfg.set("home_dir", tmp.path().to_str().unwrap()).unwrap();
        let config = cfg
            .try_into::<crate::config::NotValidatedConfiguration>()
            .unwrap()
            .validate()
            .unwrap();
        Workspace::resolve(&config, OrgContext::anonymous()).unwrap()
    }

    #[tokio::test]
    async fn records_round_trip_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);

        let record = ProviderRecord {
            id: "p1".to_string(),
            team_id: Some("team1".to_string()),
            name: "homelab".to_string(),
            config: serde_yaml::from_str("type: local\n").unwrap(),
        };
        record.save(&ws).await.unwrap();

        let found = ProviderRecord::find(&ws, "homelab").await.unwrap();
        assert_eq!(found.id, "p1");
        assert_eq!(found.config.provider_type(), "local");

        assert!(ProviderRecord::find(&ws, "missing").await.is_none());
        assert_eq!(ProviderRecord::list(&ws).await.unwrap().len(), 1);
    }
}
