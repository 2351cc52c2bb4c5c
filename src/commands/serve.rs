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

use anyhow::Result;
use log::info;
use log::warn;

use crate::config::Configuration;
use crate::dispatcher::{Dispatcher, DrainOutcome};
use crate::lifespan::Lifespan;
use crate::storage::{OrgContext, Workspace};

/// Run the dispatcher until the process receives SIGINT.
///
/// Startup settles the workspace before the loop begins; shutdown
/// guarantees the background loop is cancelled and cleanup hooks run.
pub async fn serve(config: Arc<Configuration>) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(config.clone()));

    let mut lifespan = Lifespan::new();
    let startup_result = async {
        lifespan
            .startup("resolve workspace", async {
                Workspace::resolve(&config, OrgContext::anonymous()).map(|_| ())
            })
            .await?;

        let dispatcher = dispatcher.clone();
        lifespan.spawn_background("dispatcher", async move {
            if let Err(e) = dispatcher.serve().await {
                warn!("Dispatcher loop ended: {}", e);
            }
        });
        lifespan.on_shutdown(|| info!("Dispatcher stopped"));
        Ok(())
    }
    .await;
    let lifespan = lifespan.ready(startup_result).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    lifespan.shutdown().await;
    Ok(())
}

/// Settle exited runs and drain at most one job, then report.
pub async fn dispatch_once(config: Arc<Configuration>) -> Result<()> {
    let dispatcher = Dispatcher::new(config);
    dispatcher.poll_running_jobs().await?;
    match dispatcher.start_next_job().await? {
        DrainOutcome::Started { job_id, message } => {
            info!("Dispatched job {}", job_id);
            println!("{}", message);
        }
        outcome => println!("{}", outcome.message()),
    }
    Ok(())
}
