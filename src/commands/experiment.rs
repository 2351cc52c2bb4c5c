//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::anyhow;
use anyhow::Result;
use clap::ArgMatches;
use colored::Colorize;
use serde_json::Value;

use crate::config::Configuration;
use crate::store::experiment::Experiment;

pub async fn experiment(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    match matches.subcommand() {
        Some(("list", m)) => list(m, config).await,
        Some(("create", m)) => create(m, config).await,
        Some(("delete", m)) => delete(m, config).await,
        Some(("rebuild-index", m)) => rebuild_index(m, config).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

async fn list(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    for doc in Experiment::get_all(&ws).await? {
        let id = doc.get("id").and_then(Value::as_str).unwrap_or("?");
        let name = doc.get("name").and_then(Value::as_str).unwrap_or(id);
        println!("{} ({})", name, id);
    }
    Ok(())
}

async fn create(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let name = matches.value_of("name").unwrap_or_default();
    let exp = Experiment::create(&ws, name).await?;
    println!("Experiment {} created", exp.id().green());
    Ok(())
}

async fn delete(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let name = matches.value_of("name").unwrap_or_default();

    if !matches.is_present("yes") {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Delete experiment '{}' and all of its jobs?",
                name
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    let exp = Experiment::get(&ws, name).await?;
    exp.delete().await?;
    println!("Experiment {} deleted", name.red());
    Ok(())
}

async fn rebuild_index(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let name = matches.value_of("name").unwrap_or_default();
    let exp = Experiment::get(&ws, name).await?;
    exp.trigger_cache_rebuild(true).await;
    println!("Job index for {} rebuilt", name);
    Ok(())
}
