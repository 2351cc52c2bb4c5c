//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Server-sent-event framing for log streaming endpoints.
//!
//! Streams are `text/event-stream` bodies of `data: <line>\n\n` frames
//! with a terminal `data: [DONE]\n\n`.

use futures::Stream;
use futures::StreamExt;

pub const SSE_DONE_FRAME: &str = "data: [DONE]\n\n";

/// Wrap one payload line into an SSE data frame.
pub fn sse_frame(line: &str) -> String {
    format!("data: {}\n\n", line)
}

/// Frame every item of a line stream and append the terminal frame.
pub fn sse_stream<'a, S>(lines: S) -> impl Stream<Item = String> + 'a
where
    S: Stream<Item = String> + 'a,
{
    lines
        .map(|line| sse_frame(&line))
        .chain(futures::stream::once(async {
            SSE_DONE_FRAME.to_string()
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_the_line() {
        assert_eq!(sse_frame("hello"), "data: hello\n\n");
        assert_eq!(sse_frame(""), "data: \n\n");
    }

    #[tokio::test]
    async fn streams_end_with_done() {
        let lines = futures::stream::iter(vec!["a".to_string(), "b".to_string()]);
        let frames: Vec<String> = sse_stream(lines).collect().await;
        assert_eq!(
            frames,
            vec![
                "data: a\n\n".to_string(),
                "data: b\n\n".to_string(),
                SSE_DONE_FRAME.to_string(),
            ]
        );
    }
}
