//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::time::Duration;

use anyhow::Result;
use futures::Stream;
use log::trace;

use crate::storage::Storage;

/// The last `n` lines of a log file. The whole file when `n` is None.
pub async fn tail(storage: &Storage, path: &str, n: Option<usize>) -> Result<String> {
    let content = storage.read_to_string(path).await.unwrap_or_default();
    Ok(match n {
        None => content,
        Some(n) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
    })
}

struct FollowState<F> {
    offset: usize,
    pending: Vec<String>,
    done: bool,
    stop_when: F,
}

/// Follow a log file: yield every line already present, then poll for
/// growth and yield new complete lines as they appear. The stream ends
/// when `stop_when` reports true and no unread data remains.
///
/// Polling is the portability fallback; it works on every storage
/// backend, inotify-style watching on none of the remote ones.
pub fn follow<'a, F>(
    storage: &'a Storage,
    path: &'a str,
    poll_interval: Duration,
    stop_when: F,
) -> impl Stream<Item = String> + 'a
where
    F: Fn() -> bool + Send + 'a,
{
    let initial = FollowState {
        offset: 0,
        pending: Vec::new(),
        done: false,
        stop_when,
    };

    futures::stream::unfold(initial, move |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop() {
                return Some((line, state));
            }
            if state.done {
                return None;
            }

            let content = storage.read_to_string(path).await.unwrap_or_default();
            if content.len() > state.offset {
                let fresh = &content[state.offset..];
                // Only complete lines are emitted; a trailing fragment
                // stays for the next poll
                let consumed = match fresh.rfind('\n') {
                    Some(last_newline) => last_newline + 1,
                    None => 0,
                };
                if consumed > 0 {
                    let mut lines: Vec<String> =
                        fresh[..consumed].lines().map(|l| l.to_string()).collect();
                    lines.reverse();
                    state.offset += consumed;
                    state.pending = lines;
                    continue;
                }
            }

            if (state.stop_when)() {
                trace!("Log follow for {} finished", path);
                state.done = true;
                continue;
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::for_root(tmp.path().to_str().unwrap()).unwrap();
        let path = format!("{}/log.txt", tmp.path().display());
        storage.write(&path, b"a\nb\nc\n").await.unwrap();

        assert_eq!(tail(&storage, &path, Some(2)).await.unwrap(), "b\nc");
        assert_eq!(tail(&storage, &path, None).await.unwrap(), "a\nb\nc\n");
        assert_eq!(tail(&storage, "/missing", Some(2)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn follow_yields_lines_then_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::for_root(tmp.path().to_str().unwrap()).unwrap();
        let path = format!("{}/log.txt", tmp.path().display());
        storage.write(&path, b"one\ntwo\npartial").await.unwrap();

        let stream = follow(&storage, &path, Duration::from_millis(10), || true);
        let lines: Vec<String> = stream.collect().await;
        // the unfinished line is not emitted
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }
}
