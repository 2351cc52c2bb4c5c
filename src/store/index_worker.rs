//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Background job-index rebuild worker.
//!
//! Call sites that mutate a job's status or membership add
//! `(experiment_id, workspace_root)` tuples to a pending set; a single
//! daemon thread drains it at roughly 1 Hz and rewrites each
//! experiment's `jobs.json`. The worker holds no experiment or job
//! handles, only the tuples it drained, so it cannot keep workspace
//! state alive across org switches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::trace;
use log::warn;

use crate::storage::Storage;
use crate::store::experiment::rebuild_jobs_index;

lazy_static::lazy_static! {
    static ref PENDING: Mutex<HashSet<(String, String)>> = Mutex::new(HashSet::new());
}

static WORKER_STARTED: AtomicBool = AtomicBool::new(false);

/// Schedule a rebuild of one experiment's job index. Non-blocking;
/// duplicate requests between drains collapse into one rebuild.
pub fn trigger(experiment_id: &str, workspace_root: &str) {
    {
        let mut pending = match PENDING.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.insert((experiment_id.to_string(), workspace_root.to_string()));
    }
    ensure_worker();
}

fn ensure_worker() {
    if WORKER_STARTED.swap(true, Ordering::SeqCst) {
        return;
    }

    std::thread::Builder::new()
        .name("kiln-index-rebuild".to_string())
        .spawn(worker_loop)
        .map(|_| ())
        .unwrap_or_else(|e| {
            WORKER_STARTED.store(false, Ordering::SeqCst);
            warn!("Could not start index rebuild worker: {}", e);
        });
}

fn worker_loop() {
    trace!("Index rebuild worker started");
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("Index rebuild worker has no runtime: {}", e);
            WORKER_STARTED.store(false, Ordering::SeqCst);
            return;
        }
    };

    loop {
        let batch: Vec<(String, String)> = {
            let mut pending = match PENDING.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.drain().collect()
        };

        let mut had_error = false;
        for (experiment_id, workspace_root) in batch {
            trace!(
                "Rebuilding job index for experiment {} in {}",
                experiment_id,
                workspace_root
            );
            let result = runtime.block_on(async {
                let storage = Storage::for_root(&workspace_root)?;
                rebuild_jobs_index(&storage, &workspace_root, &experiment_id).await
            });
            if let Err(e) = result {
                warn!(
                    "Rebuilding index for experiment {} failed: {}",
                    experiment_id, e
                );
                had_error = true;
            }
        }

        std::thread::sleep(if had_error {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(1)
        });
    }
}
