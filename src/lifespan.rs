//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Process lifespan management: startup tasks that must settle before
//! the system is ready, background tasks with guaranteed cancellation,
//! and cleanup hooks that run even when startup fails.

use std::future::Future;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use tokio::task::JoinHandle;

/// Cancel a background task and wait for it to exit.
///
/// Tolerates everything a task handle can be by the time shutdown runs:
/// absent, already finished, already panicked.
pub async fn cancel_task(name: &str, handle: Option<JoinHandle<()>>) {
    let handle = match handle {
        Some(h) => h,
        None => return,
    };
    if handle.is_finished() {
        debug!("Background task '{}' already finished", name);
        // Reap the result; a panic here is not ours to propagate
        let _ = handle.await;
        return;
    }
    handle.abort();
    match handle.await {
        Ok(()) => debug!("Background task '{}' exited", name),
        Err(e) if e.is_cancelled() => debug!("Background task '{}' cancelled", name),
        Err(e) => warn!("Background task '{}' ended abnormally: {}", name, e),
    }
}

type CleanupHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct Lifespan {
    background: Vec<(String, Option<JoinHandle<()>>)>,
    cleanup: Vec<CleanupHook>,
}

impl Lifespan {
    pub fn new() -> Lifespan {
        Lifespan::default()
    }

    /// Run a startup step to completion. The step name shows up in the
    /// error chain when it fails.
    pub async fn startup<F>(&mut self, name: &str, step: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        info!("Startup: {}", name);
        step.await
            .with_context(|| anyhow!("Startup step '{}' failed", name))
    }

    /// Spawn a background task that lives until shutdown.
    pub fn spawn_background<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Spawning background task '{}'", name);
        self.background
            .push((name.to_string(), Some(tokio::spawn(task))));
    }

    /// Register a hook to run at shutdown, after all background tasks
    /// are gone. Hooks run in registration order, unconditionally.
    pub fn on_shutdown<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup.push(Box::new(hook));
    }

    /// Tear the process state down: every background task is cancelled
    /// with a guaranteed exit, then every cleanup hook runs.
    pub async fn shutdown(mut self) {
        for (name, handle) in self.background.drain(..) {
            cancel_task(&name, handle).await;
        }
        for hook in self.cleanup.drain(..) {
            hook();
        }
        info!("Shutdown complete");
    }
}

impl Lifespan {
    /// Seal the startup phase: on error the lifespan tears itself down
    /// (cancelling whatever startup already spawned and running every
    /// cleanup hook) before the error propagates.
    pub async fn ready(self, startup_result: Result<()>) -> Result<Lifespan> {
        match startup_result {
            Ok(()) => Ok(self),
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn cancel_tolerates_none_and_done_and_failed() {
        cancel_task("none", None).await;

        let done = tokio::spawn(async {});
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !done.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await;
        cancel_task("done", Some(done)).await;

        let failed = tokio::spawn(async { panic!("boom") });
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !failed.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await;
        cancel_task("failed", Some(failed)).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_background_and_runs_hooks() {
        let hook_ran = Arc::new(AtomicBool::new(false));
        let mut lifespan = Lifespan::new();

        lifespan.spawn_background("forever", async {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        });

        let flag = hook_ran.clone();
        lifespan.on_shutdown(move || flag.store(true, Ordering::SeqCst));

        lifespan.shutdown().await;
        assert!(hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_startup_still_cleans_up() {
        let hook_ran = Arc::new(AtomicBool::new(false));
        let flag = hook_ran.clone();

        let mut lifespan = Lifespan::new();
        lifespan.on_shutdown(move || flag.store(true, Ordering::SeqCst));
        lifespan.spawn_background("noop", async {});

        let result = lifespan.ready(Err(anyhow!("init failed"))).await;
        assert!(result.is_err());
        assert!(hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn successful_startup_keeps_lifespan() {
        let mut lifespan = Lifespan::new();
        lifespan.spawn_background("noop", async {});
        let lifespan = lifespan.ready(Ok(())).await.unwrap();
        lifespan.shutdown().await;
    }
}
