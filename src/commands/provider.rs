//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use clap::ArgMatches;
use colored::Colorize;

use crate::config::Configuration;
use crate::provider::router::ProviderRouter;
use crate::provider::ComputeProvider;
use crate::storage::Workspace;
use crate::store::provider_record::ProviderRecord;

pub async fn provider(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let router = ProviderRouter::load(config.providers_file().as_deref());

    match matches.subcommand() {
        Some(("list", m)) => list(m, config, &router).await,
        Some(("check", m)) => check(m, config, &router).await,
        Some(("status", m)) => status(m, config, &router).await,
        Some(("resources", m)) => resources(m, config, &router).await,
        Some(("clusters", m)) => clusters(m, config, &router).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

async fn resolve(
    matches: &ArgMatches,
    config: &Configuration,
    router: &ProviderRouter,
) -> Result<(Workspace, Arc<dyn ComputeProvider>)> {
    let ws = super::workspace_from(config, matches)?;
    let name = matches.value_of("name").unwrap_or_default();
    let provider = router.get_provider(&ws, name).await?;
    Ok((ws, provider))
}

async fn list(matches: &ArgMatches, config: &Configuration, router: &ProviderRouter) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;

    let mut names = router.available();
    for record in ProviderRecord::list(&ws).await? {
        if !names.contains(&record.name) {
            names.push(record.name);
        }
    }
    names.sort();

    for name in names {
        let alive = router.check(&ws, &name).await;
        let marker = if alive {
            "up".green()
        } else {
            "unreachable".red()
        };
        println!("{}\t{}", name, marker);
    }
    Ok(())
}

async fn check(matches: &ArgMatches, config: &Configuration, router: &ProviderRouter) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let name = matches.value_of("name").unwrap_or_default();
    if router.check(&ws, name).await {
        println!("{}", "up".green());
        Ok(())
    } else {
        println!("{}", "unreachable".red());
        Err(anyhow!("Provider '{}' failed its liveness check", name))
    }
}

async fn status(matches: &ArgMatches, config: &Configuration, router: &ProviderRouter) -> Result<()> {
    let (_, provider) = resolve(matches, config, router).await?;
    let cluster = matches.value_of("cluster").unwrap_or_default().to_string();

    let status = tokio::task::spawn_blocking(move || provider.get_cluster_status(&cluster))
        .await?
        .map_err(|e| anyhow!("{}", e))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn resources(
    matches: &ArgMatches,
    config: &Configuration,
    router: &ProviderRouter,
) -> Result<()> {
    let (_, provider) = resolve(matches, config, router).await?;
    let cluster = matches.value_of("cluster").unwrap_or_default().to_string();

    let info = tokio::task::spawn_blocking(move || provider.get_cluster_resources(&cluster))
        .await?
        .map_err(|e| anyhow!("{}", e))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn clusters(
    matches: &ArgMatches,
    config: &Configuration,
    router: &ProviderRouter,
) -> Result<()> {
    let (_, provider) = resolve(matches, config, router).await?;
    let detailed = tokio::task::spawn_blocking(move || provider.get_clusters_detailed())
        .await?
        .map_err(|e| anyhow!("{}", e))?;
    println!("{}", serde_json::to_string_pretty(&detailed)?);
    Ok(())
}
