//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Classification of plugin subprocess failures from their output.

/// A failure worth a targeted error message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    OutOfMemory,
    Error(String),
}

impl FailureKind {
    pub fn message(&self) -> String {
        match self {
            FailureKind::OutOfMemory => {
                "Job ran out of GPU memory. Reduce the batch size, sequence length or \
                 model size, or run on a larger accelerator."
                    .to_string()
            }
            FailureKind::Error(line) => line.clone(),
        }
    }
}

/// Inspect the tail of a run's stderr. OOM markers win over generic
/// errors; an empty or harmless tail classifies as no failure.
pub fn classify_output(stderr_tail: &str) -> Option<FailureKind> {
    let lower = stderr_tail.to_lowercase();
    if lower.contains("cuda out of memory")
        || lower.contains("outofmemoryerror")
        || lower.contains("killed") && lower.contains("signal 9")
    {
        return Some(FailureKind::OutOfMemory);
    }

    // The last traceback/error line is the most useful thing to record
    let error_line = stderr_tail
        .lines()
        .rev()
        .find(|line| {
            let l = line.trim();
            !l.is_empty()
                && (l.contains("Error") || l.contains("error:") || l.starts_with("Traceback"))
        })
        .map(|l| l.trim().to_string());

    error_line.map(FailureKind::Error)
}

/// Last `n` lines of a blob of output.
pub fn tail_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_markers_detected() {
        assert_eq!(
            classify_output("torch.cuda.OutOfMemoryError: CUDA out of memory"),
            Some(FailureKind::OutOfMemory)
        );
        assert_eq!(
            classify_output("RuntimeError: CUDA out of memory. Tried to allocate"),
            Some(FailureKind::OutOfMemory)
        );
    }

    #[test]
    fn generic_error_line_is_captured() {
        let tail = "step 1\nValueError: bad config\n";
        match classify_output(tail) {
            Some(FailureKind::Error(line)) => assert_eq!(line, "ValueError: bad config"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn clean_output_classifies_as_none() {
        assert_eq!(classify_output("all good\ndone\n"), None);
        assert_eq!(classify_output(""), None);
    }

    #[test]
    fn oom_killer_signature_reads_as_oom() {
        assert_eq!(
            classify_output("process was killed by signal 9 (SIGKILL)"),
            Some(FailureKind::OutOfMemory)
        );
    }

    #[test]
    fn tailing() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
