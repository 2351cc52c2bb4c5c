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

use crate::config::Configuration;
use crate::storage;
use crate::store::resource::ResourceDir;
use crate::util::progress::ProgressBars;

pub async fn store(
    matches: &ArgMatches,
    config: &Configuration,
    progressbars: ProgressBars,
) -> Result<()> {
    match matches.subcommand() {
        Some(("migrate", m)) => migrate(m, config, progressbars).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

/// Walk every resource directory of the workspace and collapse legacy
/// snapshot layouts into single `index.json` documents.
async fn migrate(
    matches: &ArgMatches,
    config: &Configuration,
    progressbars: ProgressBars,
) -> Result<()> {
    let ws = super::workspace_from(config, matches)?;
    let bar = progressbars.spinner();

    let parents = [
        ws.experiments_dir(),
        ws.jobs_dir(),
        ws.datasets_dir(),
        ws.models_dir(),
        ws.tasks_dir(),
        ws.templates_dir(),
    ];

    let mut migrated = 0usize;
    for parent in parents {
        for entry in ws.storage().ls(&parent).await.unwrap_or_default() {
            if !ws.storage().isdir(&entry).await.unwrap_or(false) {
                continue;
            }
            bar.set_message(format!("Migrating {}", storage::file_name(&entry)));
            let res = ResourceDir::new(ws.storage().clone(), entry);
            res.migrate_to_single_index().await;
            migrated += 1;
            bar.tick();
        }
    }

    bar.finish_with_message(format!("Checked {} resource directories", migrated));
    Ok(())
}
