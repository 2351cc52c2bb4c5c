//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Shared machinery for filesystem-backed resources.
//!
//! Every resource (job, experiment, dataset, model, task, template,
//! provider record) is a directory holding an `index.json` document. The
//! operations here implement the common contract: create fails when the
//! resource exists, get requires the directory and heals a missing
//! document, reads are tolerant of trailing garbage, writes replace the
//! document whole.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use serde_json::Value;

use crate::consts::INDEX_JSON;
use crate::storage::{self, Storage};

#[derive(Clone, Debug)]
pub struct ResourceDir {
    storage: Storage,
    dir: String,
}

impl ResourceDir {
    pub fn new(storage: Storage, dir: String) -> Self {
        ResourceDir { storage, dir }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn index_file(&self) -> String {
        storage::join(&self.dir, &[INDEX_JSON])
    }

    /// Create the resource directory and write the default document.
    /// Fails if the document already exists.
    pub async fn initialize(&self, kind: &str, id: &str, default: &Value) -> Result<()> {
        self.storage.makedirs(&self.dir).await?;
        debug!("Created directory for {} with id '{}'", kind, id);

        let index_file = self.index_file();
        if self.storage.isfile(&index_file).await? {
            return Err(anyhow!("{} with id '{}' already exists", kind, id));
        }
        self.write_document(default).await
    }

    /// Require the resource directory to exist; heal a missing document
    /// by writing the default.
    pub async fn open_existing(&self, kind: &str, id: &str, default: &Value) -> Result<()> {
        if !self.storage.isdir(&self.dir).await? {
            return Err(anyhow!(
                "Directory for {} with id '{}' not found",
                kind,
                id
            ));
        }
        let index_file = self.index_file();
        if !self.storage.isfile(&index_file).await? {
            self.write_document(default).await?;
        }
        Ok(())
    }

    /// Read the resource document. Whitespace and trailing `%` characters
    /// (shell-redirect artifacts) are stripped; any parse failure reads as
    /// an empty object.
    pub async fn json_data(&self) -> Result<Value> {
        self.migrate_to_single_index().await;

        let content = match self.storage.read_to_string(&self.index_file()).await {
            Ok(content) => content,
            Err(_) => return Ok(Value::Object(Default::default())),
        };

        let content = content.trim().trim_end_matches('%').trim();
        match serde_json::from_str(content) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Unparseable document in {}: {}", self.index_file(), e);
                Ok(Value::Object(Default::default()))
            }
        }
    }

    /// Replace the resource document whole. Only JSON objects are valid
    /// documents.
    pub async fn set_json_data(&self, data: &Value) -> Result<()> {
        if !data.is_object() {
            return Err(anyhow!("Resource document must be a JSON object"));
        }
        self.migrate_to_single_index().await;
        self.write_document(data).await
    }

    pub async fn get_field(&self, key: &str) -> Result<Value> {
        Ok(self
            .json_data()
            .await?
            .get(key)
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn update_field(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.json_data().await?;
        if !data.is_object() {
            data = Value::Object(Default::default());
        }
        if let Some(m) = data.as_object_mut() {
            m.insert(key.to_string(), value);
        }
        self.set_json_data(&data).await
    }

    async fn write_document(&self, data: &Value) -> Result<()> {
        let rendered = serde_json::to_vec(data)
            .with_context(|| anyhow!("Serializing document for {}", self.dir))?;
        self.storage
            .write(&self.index_file(), &rendered)
            .await
            .with_context(|| anyhow!("Writing document {}", self.index_file()))
    }

    /// Collapse legacy `index-<timestamp>.json` + `latest.txt` snapshot
    /// layouts into a single `index.json`. Idempotent; failures leave the
    /// directory untouched.
    pub async fn migrate_to_single_index(&self) {
        if let Err(e) = self.try_migrate().await {
            warn!("Snapshot migration failed for {}: {}", self.dir, e);
        }
    }

    async fn try_migrate(&self) -> Result<()> {
        if !self.storage.isdir(&self.dir).await? {
            return Ok(());
        }

        let entries = self.storage.ls(&self.dir).await.unwrap_or_default();
        let snapshots: Vec<&String> = entries
            .iter()
            .filter(|p| {
                let name = storage::file_name(p);
                name.starts_with("index-") && name.ends_with(".json")
            })
            .collect();

        if snapshots.is_empty() {
            return Ok(());
        }

        // Prefer the snapshot named by latest.txt, fall back to the
        // newest timestamp. The stamps are fixed-width UTC so the
        // lexicographic maximum is the latest.
        let latest_txt = storage::join(&self.dir, &["latest.txt"]);
        let mut latest: Option<String> = None;
        if self.storage.isfile(&latest_txt).await? {
            if let Ok(named) = self.storage.read_to_string(&latest_txt).await {
                let named = named.trim();
                if !named.is_empty() {
                    let candidate = storage::join(&self.dir, &[named]);
                    if self.storage.isfile(&candidate).await? {
                        latest = Some(candidate);
                    }
                }
            }
        }
        if latest.is_none() {
            latest = snapshots
                .iter()
                .max_by(|a, b| storage::file_name(a).cmp(storage::file_name(b)))
                .map(|s| s.to_string());
        }

        let latest = match latest {
            Some(l) => l,
            None => return Ok(()),
        };

        if !self.storage.isfile(&self.index_file()).await? {
            let content = self.storage.read(&latest).await?;
            // Snapshots must parse before they replace the live document
            let parsed: Value = serde_json::from_slice(&content)
                .with_context(|| anyhow!("Parsing snapshot {}", latest))?;
            self.write_document(&parsed).await?;
        }

        for snapshot in snapshots {
            self.storage.rm(snapshot).await?;
        }
        if self.storage.isfile(&latest_txt).await? {
            self.storage.rm(&latest_txt).await?;
        }

        Ok(())
    }

    /// Remove the resource directory recursively.
    pub async fn delete(&self) -> Result<()> {
        if self.storage.exists(&self.dir).await? {
            self.storage.rm_tree(&self.dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn resource(tmp: &tempfile::TempDir) -> ResourceDir {
        let root = tmp.path().to_str().unwrap().to_string();
        let storage = Storage::for_root(&root).unwrap();
        ResourceDir::new(storage, storage::join(&root, &["res", "1"]))
    }

    #[tokio::test]
    async fn create_then_get_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resource(&tmp).await;
        let default = json!({"id": "1", "status": "NOT_STARTED"});

        res.initialize("Test", "1", &default).await.unwrap();
        assert_eq!(res.json_data().await.unwrap(), default);

        // creating again fails
        assert!(res.initialize("Test", "1", &default).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_document_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resource(&tmp).await;
        res.initialize("Test", "1", &json!({"id": "1"}))
            .await
            .unwrap();

        res.storage()
            .write(&res.index_file(), b"{\"id\": 1,,,")
            .await
            .unwrap();
        assert_eq!(res.json_data().await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn trailing_percent_is_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resource(&tmp).await;
        res.initialize("Test", "1", &json!({"id": "1"}))
            .await
            .unwrap();

        res.storage()
            .write(&res.index_file(), b"{\"id\": \"1\"}  %\n")
            .await
            .unwrap();
        assert_eq!(res.json_data().await.unwrap(), json!({"id": "1"}));
    }

    #[tokio::test]
    async fn legacy_snapshots_collapse_to_index() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resource(&tmp).await;
        let dir = res.dir().to_string();

        res.storage().makedirs(&dir).await.unwrap();
        res.storage()
            .write(
                &storage::join(&dir, &["index-20240101T000000000000Z.json"]),
                b"{\"v\": 1}",
            )
            .await
            .unwrap();
        res.storage()
            .write(
                &storage::join(&dir, &["index-20240201T000000000000Z.json"]),
                b"{\"v\": 2}",
            )
            .await
            .unwrap();

        assert_eq!(res.json_data().await.unwrap(), json!({"v": 2}));
        // snapshots are gone, migration is idempotent
        assert_eq!(res.json_data().await.unwrap(), json!({"v": 2}));
        let entries = res.storage().ls(&dir).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn update_field_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let res = resource(&tmp).await;
        res.initialize("Test", "1", &json!({"id": "1"}))
            .await
            .unwrap();

        res.update_field("status", json!("QUEUED")).await.unwrap();
        assert_eq!(res.get_field("status").await.unwrap(), json!("QUEUED"));
        assert_eq!(res.get_field("missing").await.unwrap(), Value::Null);
    }
}
