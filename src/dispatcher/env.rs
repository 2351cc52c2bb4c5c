//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Environment construction for plugin subprocesses: identity context,
//! the base project location for venv sync, and mapped secrets.
//!
//! Secrets go into the subprocess environment only; they are never
//! written below the workspace root.

use std::collections::BTreeMap;

use anyhow::Result;
use log::warn;
use serde_json::Value;

use crate::config::Configuration;
use crate::consts::*;
use crate::storage::Workspace;

/// Secret-store name -> environment variable name.
const SECRET_ENV_MAP: &[(&str, &str)] = &[
    ("HuggingfaceUserAccessToken", "HF_TOKEN"),
    ("WANDB_API_KEY", "WANDB_API_KEY"),
    ("OPENAI_API_KEY", "OPENAI_API_KEY"),
    ("ANTHROPIC_API_KEY", "ANTHROPIC_API_KEY"),
    ("CUSTOM_MODEL_API_KEY", "CUSTOM_MODEL_API_KEY"),
    ("AZURE_OPENAI_DETAILS", "AZURE_OPENAI_DETAILS"),
];

/// Read the team secrets file (name -> value). A missing or unreadable
/// file yields no secrets; dispatching proceeds without them.
pub fn load_team_secrets(config: &Configuration) -> BTreeMap<String, String> {
    let file = match config.secrets_file() {
        Some(f) => f,
        None => return Default::default(),
    };

    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => {
            warn!("Could not read secrets file {}: {}", file.display(), e);
            return Default::default();
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect(),
        _ => {
            warn!("Secrets file {} is not a JSON object", file.display());
            Default::default()
        }
    }
}

/// Environment variables for a plugin job: job/experiment identity, the
/// base project directory, and the mapped provider/API secrets.
pub fn build_plugin_job_env_vars(
    config: &Configuration,
    ws: &Workspace,
    job_id: &str,
    experiment_name: &str,
) -> Result<BTreeMap<String, String>> {
    let mut env_vars = BTreeMap::new();

    env_vars.insert(ENV_JOB_ID.to_string(), job_id.to_string());
    env_vars.insert(ENV_EXPERIMENT_ID.to_string(), experiment_name.to_string());
    if let Some(org_id) = &ws.org().org_id {
        env_vars.insert(ENV_ORG_ID.to_string(), org_id.clone());
    }
    if let Some(user_id) = &ws.org().user_id {
        env_vars.insert(ENV_USER_ID.to_string(), user_id.clone());
    }

    // The local provider syncs the per-job venv from this checkout
    let source_code_dir = std::env::var(ENV_SOURCE_CODE_DIR)
        .ok()
        .filter(|d| !d.is_empty())
        .or_else(|| {
            config
                .source_code_dir()
                .as_ref()
                .map(|d| d.to_string_lossy().to_string())
        });
    if let Some(dir) = source_code_dir {
        env_vars.insert(ENV_SOURCE_CODE_DIR.to_string(), dir);
    }

    let secrets = load_team_secrets(config);
    for (secret_name, env_name) in SECRET_ENV_MAP {
        if let Some(value) = secrets.get(*secret_name).filter(|v| !v.is_empty()) {
            env_vars.insert(env_name.to_string(), value.clone());
        }
    }

    Ok(env_vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrgContext;

    fn test_config(tmp: &tempfile::TempDir, secrets: Option<&str>) -> Configuration {
        let mut cfg = config::Config::default();
        cfg.set("compatibility", "*").unwrap();
        cfg.set("home_dir", tmp.path().to_str().unwrap()).unwrap();
        if let Some(content) = secrets {
            let file = tmp.path().join("secrets.json");
            std::fs::write(&file, content).unwrap();
            cfg.set("secrets_file", file.to_str().unwrap()).unwrap();
        }
        cfg.try_into::<crate::config::NotValidatedConfiguration>()
            .unwrap()
            .validate()
            .unwrap()
    }

    #[test]
    fn identity_and_secrets_are_mapped() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(
            &tmp,
            Some(r#"{"HuggingfaceUserAccessToken": "hf_x", "WANDB_API_KEY": "w", "unused": "u"}"#),
        );
        let ws = Workspace::resolve(&config, OrgContext::for_org("team1")).unwrap();

        let env = build_plugin_job_env_vars(&config, &ws, "12", "alpha").unwrap();
        assert_eq!(env.get(ENV_JOB_ID).map(String::as_str), Some("12"));
        assert_eq!(env.get(ENV_EXPERIMENT_ID).map(String::as_str), Some("alpha"));
        assert_eq!(env.get(ENV_ORG_ID).map(String::as_str), Some("team1"));
        assert_eq!(env.get("HF_TOKEN").map(String::as_str), Some("hf_x"));
        assert_eq!(env.get("WANDB_API_KEY").map(String::as_str), Some("w"));
        assert!(!env.contains_key("unused"));
    }

    #[test]
    fn missing_secrets_file_yields_no_secrets() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp, None);
        let ws = Workspace::resolve(&config, OrgContext::anonymous()).unwrap();

        let env = build_plugin_job_env_vars(&config, &ws, "1", "e").unwrap();
        assert!(!env.contains_key("HF_TOKEN"));
        assert!(!env.contains_key(ENV_ORG_ID));
    }
}
