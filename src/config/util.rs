//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! This module contains default functions that are called by serde when deserializing the
//! configuration and having to use default values.

/// Accept any crate version unless the configuration pins one
pub fn default_compatibility() -> semver::VersionReq {
    semver::VersionReq::STAR
}

/// The default progress bar format
pub fn default_progress_format() -> String {
    String::from("{elapsed_precise} {percent:>3}% {bar:5.cyan/blue} | {msg}")
}

/// The default spinner format
pub fn default_spinner_format() -> String {
    String::from("{spinner} | {msg}")
}

/// The default number of seconds the dispatcher sleeps between queue drains
pub fn default_dispatch_interval() -> u64 {
    2
}

/// The default number of milliseconds between polls when tailing a job log
pub fn default_log_poll_millis() -> u64 {
    500
}

/// The default number of stderr lines recorded on the job when a launch fails
pub fn default_error_log_lines() -> usize {
    10
}
