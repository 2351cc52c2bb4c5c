//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Typed, provider-discriminated configuration.
//!
//! Provider records in the store and entries in the optional providers
//! YAML file both deserialize into `ProviderSettings`; the factory turns
//! a settings value into a live provider instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::provider::local::LocalProvider;
use crate::provider::runpod::RunpodProvider;
use crate::provider::skypilot::SkypilotProvider;
use crate::provider::slurm::{SlurmMode, SlurmProvider};
use crate::provider::ComputeProvider;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderSettings {
    Local {},

    Slurm {
        mode: SlurmMode,
        #[serde(default)]
        rest_url: Option<String>,
        #[serde(default)]
        ssh_host: Option<String>,
        #[serde(default)]
        ssh_user: Option<String>,
        #[serde(default)]
        ssh_key_path: Option<String>,
        #[serde(default = "default_ssh_port")]
        ssh_port: u16,
        #[serde(default)]
        api_token: Option<String>,
    },

    Skypilot {
        server_url: String,
        #[serde(default)]
        api_token: Option<String>,
        #[serde(default)]
        default_env_vars: BTreeMap<String, String>,
        #[serde(default)]
        default_entrypoint_command: Option<String>,
    },

    Runpod {
        api_key: String,
        #[serde(default)]
        api_base_url: Option<String>,
        #[serde(default)]
        default_gpu_type: Option<String>,
        #[serde(default)]
        default_region: Option<String>,
        #[serde(default)]
        default_template_id: Option<String>,
        #[serde(default)]
        default_network_volume_id: Option<String>,
        #[serde(default)]
        default_volume_gb: Option<u64>,
    },
}

fn default_ssh_port() -> u16 {
    22
}

impl ProviderSettings {
    pub fn provider_type(&self) -> &'static str {
        match self {
            ProviderSettings::Local { .. } => "local",
            ProviderSettings::Slurm { .. } => "slurm",
            ProviderSettings::Skypilot { .. } => "skypilot",
            ProviderSettings::Runpod { .. } => "runpod",
        }
    }

    /// Instantiate the provider these settings describe.
    pub fn build(&self) -> Result<Arc<dyn ComputeProvider>> {
        match self {
            ProviderSettings::Local {} => Ok(Arc::new(LocalProvider::new())),

            ProviderSettings::Slurm {
                mode,
                rest_url,
                ssh_host,
                ssh_user,
                ssh_key_path,
                ssh_port,
                api_token,
            } => {
                match mode {
                    SlurmMode::Rest if rest_url.is_none() => {
                        return Err(anyhow!("SLURM provider in REST mode requires rest_url"));
                    }
                    SlurmMode::Ssh if ssh_host.is_none() => {
                        return Err(anyhow!("SLURM provider in SSH mode requires ssh_host"));
                    }
                    _ => {}
                }
                Ok(Arc::new(SlurmProvider::new(
                    *mode,
                    rest_url.clone(),
                    ssh_host.clone(),
                    ssh_user.clone(),
                    ssh_key_path.clone(),
                    *ssh_port,
                    api_token.clone(),
                )))
            }

            ProviderSettings::Skypilot {
                server_url,
                api_token,
                default_env_vars,
                default_entrypoint_command,
            } => Ok(Arc::new(SkypilotProvider::new(
                server_url.clone(),
                api_token.clone(),
                default_env_vars.clone(),
                default_entrypoint_command.clone(),
            )?)),

            ProviderSettings::Runpod {
                api_key,
                api_base_url,
                default_gpu_type,
                default_region,
                default_template_id,
                default_network_volume_id,
                default_volume_gb,
            } => Ok(Arc::new(RunpodProvider::new(
                api_key.clone(),
                api_base_url.clone(),
                default_gpu_type.clone(),
                default_region.clone(),
                default_template_id.clone(),
                default_network_volume_id.clone(),
                *default_volume_gb,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_by_tag() {
        let yaml = r#"
type: slurm
mode: ssh
ssh_host: cluster.example.com
ssh_user: ml
"#;
        let settings: ProviderSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.provider_type(), "slurm");
        match settings {
            ProviderSettings::Slurm { ssh_port, ssh_host, .. } => {
                assert_eq!(ssh_port, 22);
                assert_eq!(ssh_host.as_deref(), Some("cluster.example.com"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn slurm_rest_requires_url() {
        let yaml = "type: slurm\nmode: rest\n";
        let settings: ProviderSettings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.build().is_err());
    }

    #[test]
    fn local_settings_build() {
        let settings: ProviderSettings = serde_yaml::from_str("type: local\n").unwrap();
        assert!(settings.build().is_ok());
    }
}
