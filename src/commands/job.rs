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
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::ArgMatches;
use colored::Colorize;
use futures::StreamExt;
use serde_json::Value;

use crate::config::Configuration;
use crate::dispatcher::Dispatcher;
use crate::storage::Workspace;
use crate::store::experiment::Experiment;
use crate::store::job::{Job, JobStatus, JobType};

pub async fn job(matches: &ArgMatches, config: Arc<Configuration>) -> Result<()> {
    match matches.subcommand() {
        Some(("list", m)) => list(m, &config).await,
        Some(("submit", m)) => submit(m, &config).await,
        Some(("show", m)) => show(m, &config).await,
        Some(("stop", m)) => stop(m, config).await,
        Some(("delete", m)) => delete(m, &config).await,
        Some(("logs", m)) => logs(m, &config).await,
        Some(("artifacts", m)) => artifacts(m, &config).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

fn parse_type(matches: &ArgMatches) -> Result<Option<JobType>> {
    matches
        .value_of("type")
        .map(|t| {
            t.to_uppercase()
                .parse::<JobType>()
                .map_err(|_| anyhow!("Unknown job type: {}", t))
        })
        .transpose()
}

fn parse_status(matches: &ArgMatches) -> Result<Option<JobStatus>> {
    matches
        .value_of("status")
        .map(|s| {
            s.to_uppercase()
                .parse::<JobStatus>()
                .map_err(|_| anyhow!("Unknown job status: {}", s))
        })
        .transpose()
}

async fn list(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let experiment_id = matches.value_of("experiment").unwrap_or("default");
    let exp = Experiment::get(&ws, experiment_id).await?;

    let jobs = exp
        .get_jobs(parse_type(matches)?, parse_status(matches)?)
        .await?;

    let mut table = ascii_table::AsciiTable::default();
    table.column(0).set_header("ID");
    table.column(1).set_header("TYPE");
    table.column(2).set_header("STATUS");
    table.column(3).set_header("PROGRESS");

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|doc| {
            vec![
                doc.id.clone(),
                doc.job_type.to_string(),
                doc.status.to_string(),
                format!("{}%", doc.progress),
            ]
        })
        .collect();
    table.print(rows);
    Ok(())
}

async fn submit(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let experiment_id = matches.value_of("experiment").unwrap_or("default");
    let job_type = parse_type(matches)?.unwrap_or(JobType::Undefined);

    let job_data: Option<Value> = match matches.value_of("job_data") {
        Some(spec) => {
            let raw = match spec.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| anyhow!("Reading job data file {}", path))?,
                None => spec.to_string(),
            };
            Some(serde_json::from_str(&raw).context("Parsing job data JSON")?)
        }
        None => None,
    };

    let exp = Experiment::create_or_get(&ws, experiment_id).await?;
    let job = exp.create_job().await?;
    job.set_type(job_type).await?;
    if let Some(Value::Object(data)) = job_data {
        for (key, value) in data {
            job.update_job_data_field(&key, value).await?;
        }
    }
    job.update_status(JobStatus::Queued).await?;
    exp.add_job(job.id(), job_type).await?;

    println!("{} job {} queued", job_type, job.id().to_string().green());
    Ok(())
}

async fn show(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let job_id = matches.value_of("job_id").unwrap_or_default();
    let job = Job::get(&ws, job_id).await?;
    let doc = job.document().await?;
    println!("{}", serde_json::to_string_pretty(&doc.raw)?);
    Ok(())
}

async fn stop(matches: &ArgMatches, config: Arc<Configuration>) -> Result<()> {
    let ws = super::workspace_from(&config, matches)?;
    let job_id = matches.value_of("job_id").unwrap_or_default().to_string();
    let dispatcher = Dispatcher::new(config);
    dispatcher.stop_job(&ws, &job_id).await?;
    println!("Job {} stopped", job_id.yellow());
    Ok(())
}

async fn delete(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let job_id = matches.value_of("job_id").unwrap_or_default();
    let job = Job::get(&ws, job_id).await?;
    job.delete().await?;
    println!("Job {} deleted", job_id.red());
    Ok(())
}

async fn logs(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let job_id = matches.value_of("job_id").unwrap_or_default();
    let tail_lines = matches
        .value_of("tail")
        .map(|n| n.parse::<usize>().context("Parsing --tail"))
        .transpose()?;

    let job = Job::get(&ws, job_id).await?;

    if matches.is_present("provider") {
        return provider_logs(&ws, config, &job, tail_lines, matches.is_present("follow")).await;
    }

    let log_path = job.log_path().await?;

    if matches.is_present("follow") {
        // A watcher flips the flag once the job settles; the follow
        // stream drains the remaining lines and ends
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watcher = tokio::spawn({
            let ws = ws.clone();
            let job_id = job_id.to_string();
            let done = done.clone();
            async move {
                loop {
                    let settled = match Job::get(&ws, &job_id).await {
                        Ok(job) => job
                            .status()
                            .await
                            .map(|s| s.is_terminal())
                            .unwrap_or(true),
                        Err(_) => true,
                    };
                    if settled {
                        done.store(true, std::sync::atomic::Ordering::SeqCst);
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        let stop_when = {
            let done = done.clone();
            move || done.load(std::sync::atomic::Ordering::SeqCst)
        };
        let stream = crate::joblog::follow(
            ws.storage(),
            &log_path,
            Duration::from_millis(config.log_poll_millis()),
            stop_when,
        );
        futures::pin_mut!(stream);
        while let Some(line) = stream.next().await {
            println!("{}", line);
        }
        watcher.abort();
        let _ = watcher.await;
    } else {
        let content = crate::joblog::tail(ws.storage(), &log_path, tail_lines).await?;
        println!("{}", content);
    }
    Ok(())
}

/// Fetch logs through the provider the job was bound to at submit time.
async fn provider_logs(
    ws: &Workspace,
    config: &Configuration,
    job: &Job,
    tail_lines: Option<usize>,
    follow: bool,
) -> Result<()> {
    let doc = job.document().await?;
    let provider_name = doc
        .job_data_str("provider_name")
        .unwrap_or_else(|| "local".to_string());
    let cluster_name = doc
        .job_data_str("cluster_name")
        .unwrap_or_else(|| doc.id.clone());
    let provider_job_id = doc
        .job_data_str("provider_job_id")
        .unwrap_or_else(|| cluster_name.clone());

    let provider: std::sync::Arc<dyn crate::provider::ComputeProvider> =
        if provider_name == "local" {
            std::sync::Arc::new(crate::provider::local::LocalProvider::for_run(
                ws.local_job_dir(&doc.id),
            ))
        } else {
            let router = crate::provider::router::ProviderRouter::load(
                config.providers_file().as_deref(),
            );
            router.get_provider(ws, &provider_name).await?
        };

    let output = tokio::task::spawn_blocking(move || {
        provider.get_job_logs(&cluster_name, &provider_job_id, tail_lines, follow)
    })
    .await?
    .map_err(|e| anyhow!("{}", e))?;

    match output {
        crate::provider::LogOutput::Full(content) => println!("{}", content),
        crate::provider::LogOutput::Stream(lines) => {
            for line in lines {
                println!("{}", line?);
            }
        }
    }
    Ok(())
}

async fn artifacts(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let job_id = matches.value_of("job_id").unwrap_or_default();
    let job = Job::get(&ws, job_id).await?;
    for path in job.artifact_paths().await? {
        println!("{}", path);
    }
    Ok(())
}
