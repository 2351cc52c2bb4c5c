//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Name-to-provider resolution.
//!
//! Resolution order: cached instance, then the team provider record in
//! the workspace store, then the optional YAML configuration file.
//! `check()` never propagates provider panics or errors past the
//! router; unreachable providers simply report false.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use serde::Deserialize;

use crate::provider::settings::ProviderSettings;
use crate::provider::ComputeProvider;
use crate::storage::Workspace;
use crate::store::provider_record::ProviderRecord;

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderSettings>,
}

pub struct ProviderRouter {
    instances: Mutex<HashMap<String, Arc<dyn ComputeProvider>>>,
    configs: BTreeMap<String, ProviderSettings>,
    init_errors: HashMap<String, String>,
}

impl ProviderRouter {
    /// Load the router. The YAML file is optional; providers can come
    /// from the store alone.
    pub fn load(providers_file: Option<&Path>) -> ProviderRouter {
        let mut router = ProviderRouter {
            instances: Mutex::new(HashMap::new()),
            configs: BTreeMap::new(),
            init_errors: HashMap::new(),
        };

        let file = match providers_file {
            Some(f) => f,
            None => return router,
        };

        match Self::parse_file(file) {
            Ok(configs) => {
                router.configs = configs;
                for (name, settings) in router.configs.clone() {
                    match settings.build() {
                        Ok(provider) => {
                            router.insert(&name, provider);
                        }
                        Err(e) => {
                            warn!("Failed to create compute provider '{}': {}", name, e);
                            router.init_errors.insert(name, e.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                // Providers may still be resolved from the store
                warn!("No usable providers file at {}: {}", file.display(), e);
            }
        }

        router
    }

    fn parse_file(file: &Path) -> Result<BTreeMap<String, ProviderSettings>> {
        let content = std::fs::read_to_string(file)
            .with_context(|| anyhow!("Reading providers file {}", file.display()))?;
        let parsed: ProvidersFile = serde_yaml::from_str(&content)
            .with_context(|| anyhow!("Parsing providers file {}", file.display()))?;
        Ok(parsed.providers)
    }

    fn insert(&self, name: &str, provider: Arc<dyn ComputeProvider>) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(name.to_string(), provider);
        }
    }

    fn cached(&self, name: &str) -> Option<Arc<dyn ComputeProvider>> {
        self.instances.lock().ok()?.get(name).cloned()
    }

    pub fn available(&self) -> Vec<String> {
        self.instances
            .lock()
            .map(|i| {
                let mut names: Vec<String> = i.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Manually register a provider instance.
    pub fn add_provider(&self, name: &str, provider: Arc<dyn ComputeProvider>) {
        self.insert(name, provider);
    }

    /// Resolve a provider by name for the given workspace scope.
    pub async fn get_provider(
        &self,
        ws: &Workspace,
        name: &str,
    ) -> Result<Arc<dyn ComputeProvider>> {
        if let Some(provider) = self.cached(name) {
            return Ok(provider);
        }

        // Team provider records take precedence over the file
        if let Some(record) = ProviderRecord::find(ws, name).await {
            match record.config.build() {
                Ok(provider) => {
                    debug!("Provider '{}' resolved from workspace record", name);
                    self.insert(name, provider.clone());
                    return Ok(provider);
                }
                Err(e) => {
                    warn!("Provider record '{}' failed to initialize: {}", name, e);
                }
            }
        }

        if let Some(settings) = self.configs.get(name) {
            let provider = settings.build().with_context(|| {
                anyhow!(
                    "Provider '{}' is configured but failed to initialize: {}",
                    name,
                    self.init_errors
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| "unknown error during initialization".to_string())
                )
            })?;
            self.insert(name, provider.clone());
            return Ok(provider);
        }

        Err(anyhow!(
            "Provider '{}' not found. Available providers: {:?}",
            name,
            self.available()
        ))
    }

    /// Liveness of one provider, with every failure contained. Runs the
    /// blocking `check()` on the blocking pool.
    pub async fn check(&self, ws: &Workspace, name: &str) -> bool {
        let provider = match self.get_provider(ws, name).await {
            Ok(p) => p,
            Err(_) => return false,
        };
        tokio::task::spawn_blocking(move || provider.check())
            .await
            .unwrap_or(false)
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
    async fn unknown_provider_lists_available() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let router = ProviderRouter::load(None);

        let err = router.get_provider(&ws, "nope").await.unwrap_err();
        assert!(err.to_string().contains("Available providers"));
    }

    #[tokio::test]
    async fn providers_file_resolves_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let file = tmp.path().join("providers.yaml");
        std::fs::write(&file, "providers:\n  laptop:\n    type: local\n").unwrap();

        let router = ProviderRouter::load(Some(&file));
        assert_eq!(router.available(), vec!["laptop".to_string()]);
        assert!(router.get_provider(&ws, "laptop").await.is_ok());
    }

    #[tokio::test]
    async fn store_record_wins_for_uncached_names() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = test_workspace(&tmp);
        let record = ProviderRecord {
            id: "p1".to_string(),
            team_id: None,
            name: "recorded".to_string(),
            config: serde_yaml::from_str("type: local\n").unwrap(),
        };
        record.save(&ws).await.unwrap();

        let router = ProviderRouter::load(None);
        assert!(router.get_provider(&ws, "recorded").await.is_ok());
        // now cached
        assert_eq!(router.available(), vec!["recorded".to_string()]);
    }
}
