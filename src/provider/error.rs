//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use thiserror::Error as ThisError;

/// The closed error taxonomy of the provider boundary.
///
/// Missing clusters are data, not errors: status queries return
/// `UNKNOWN` instead of `NotFound`. `NotFound` is reserved for
/// operations that cannot produce a meaningful fallback (cancelling a
/// job on a cluster that does not exist).
#[derive(ThisError, Debug)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Not supported by this provider: {0}")]
    Unsupported(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    /// Map an HTTP error into the taxonomy: auth for 401/403, transient
    /// for 5xx and timeouts, launch otherwise.
    pub fn from_http(context: &str, status: Option<u16>, body: &str) -> ProviderError {
        match status {
            Some(401) | Some(403) => ProviderError::Auth(format!("{}: {}", context, body)),
            Some(code) if code >= 500 => {
                ProviderError::Transient(format!("{}: HTTP {}: {}", context, code, body))
            }
            Some(code) => ProviderError::Launch(format!("{}: HTTP {}: {}", context, code, body)),
            None => ProviderError::Transient(format!("{}: {}", context, body)),
        }
    }
}
