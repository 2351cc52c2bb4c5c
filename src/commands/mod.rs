//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Implementations of the CLI subcommands.

mod experiment;
mod job;
mod provider;
mod serve;
mod store;
mod workflow;

pub use experiment::experiment;
pub use job::job;
pub use provider::provider;
pub use serve::dispatch_once;
pub use serve::serve;
pub use store::store;
pub use workflow::workflow;

use anyhow::Result;
use clap::ArgMatches;

use crate::config::Configuration;
use crate::storage::{OrgContext, Workspace};

/// Resolve the workspace for a subcommand, honoring `--org`.
pub(crate) fn workspace_from(config: &Configuration, matches: &ArgMatches) -> Result<Workspace> {
    let org = match matches.value_of("org") {
        Some(org_id) => OrgContext::for_org(org_id),
        None => OrgContext::anonymous(),
    };
    Workspace::resolve(config, org)
}
