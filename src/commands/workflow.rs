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
use serde_json::json;

use crate::config::Configuration;
use crate::workflow::engine;
use crate::workflow::model::{Workflow, WorkflowConfig, WorkflowRun, WORKFLOW_NOT_FOUND_ERROR};

pub async fn workflow(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    match matches.subcommand() {
        Some(("create", m)) => create(m, config).await,
        Some(("run", m)) => run(m, config).await,
        Some(("advance", m)) => advance(m, config).await,
        Some(("cancel", m)) => cancel(m, config).await,
        Some(("show", m)) => show(m, config).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

async fn create(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let workflow_id = matches.value_of("workflow_id").unwrap_or_default();
    let experiment_id = matches.value_of("experiment").unwrap_or_default();
    let name = matches.value_of("name").unwrap_or(workflow_id);

    let nodes_spec = matches.value_of("nodes").unwrap_or_default();
    let raw = match nodes_spec.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Reading workflow definition {}: {}", path, e))?,
        None => nodes_spec.to_string(),
    };
    let workflow_config: WorkflowConfig =
        serde_json::from_str(&raw).map_err(|e| anyhow!("Parsing workflow definition: {}", e))?;

    let workflow =
        Workflow::create(&ws, workflow_id, name, experiment_id, &workflow_config).await?;
    println!("Workflow {} created", workflow.id().green());
    Ok(())
}

async fn run(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let workflow_id = matches.value_of("workflow_id").unwrap_or_default();
    let experiment_id = matches.value_of("experiment").unwrap_or_default();

    match engine::start_workflow_run(&ws, workflow_id, experiment_id).await? {
        Some(run) => {
            // Queue the first layer right away
            engine::progress_workflow(&ws, run.id()).await?;
            println!("Workflow run {} started", run.id().green());
            Ok(())
        }
        None => {
            println!("{}", json!({ "error": WORKFLOW_NOT_FOUND_ERROR }));
            Ok(())
        }
    }
}

async fn advance(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let run_id = matches.value_of("run_id").unwrap_or_default();

    let outcome = engine::progress_workflow(&ws, run_id).await?;
    match outcome {
        engine::ProgressOutcome::Queued(jobs) => {
            println!("Queued jobs: {}", jobs.join(", "));
        }
        engine::ProgressOutcome::Waiting => println!("Jobs still running"),
        engine::ProgressOutcome::Complete => println!("{}", "Run complete".green()),
        engine::ProgressOutcome::Failed => println!("{}", "Run failed".red()),
        engine::ProgressOutcome::Cancelled => println!("{}", "Run cancelled".yellow()),
    }
    Ok(())
}

async fn cancel(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let run_id = matches.value_of("run_id").unwrap_or_default();
    let experiment_id = matches.value_of("experiment").unwrap_or_default();

    match engine::cancel_workflow_run(&ws, experiment_id, run_id).await? {
        Some(summary) => {
            println!(
                "{}",
                json!({
                    "message": summary.message,
                    "cancelled_jobs": summary.cancelled_jobs,
                    "note": summary.note,
                })
            );
            Ok(())
        }
        None => {
            println!("{}", json!({ "error": WORKFLOW_NOT_FOUND_ERROR }));
            Ok(())
        }
    }
}

async fn show(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let run_id = matches.value_of("run_id").unwrap_or_default();
    let run = WorkflowRun::get(&ws, run_id).await?;
    let doc = run.document().await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
