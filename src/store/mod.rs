//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The filesystem-backed state store: per-resource JSON documents below
//! an org-scoped workspace root, plus the per-experiment job index with
//! its snapshot cache and background rebuild worker.

pub mod artifacts;
pub mod dataset;
pub mod experiment;
pub mod index_worker;
pub mod job;
pub mod model;
pub mod named;
pub mod provider_record;
pub mod resource;
pub mod task;
pub mod template;

#[allow(unused_imports)]
pub use dataset::Dataset;
#[allow(unused_imports)]
pub use experiment::Experiment;
#[allow(unused_imports)]
pub use job::{Job, JobDocument, JobStatus, JobType};
#[allow(unused_imports)]
pub use model::Model;
#[allow(unused_imports)]
pub use task::Task;
#[allow(unused_imports)]
pub use template::Template;
