//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

/// Slugify a human-readable name into a lowercase, dash-joined form.
///
/// Non-alphanumeric runs collapse into a single dash and leading/trailing
/// dashes are stripped, so `"Top Level Dataset"` becomes
/// `"top-level-dataset"`.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_dash = true; // suppress a leading dash

    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }

    while out.ends_with('-') {
        out.pop();
    }

    out
}

/// Reduce an arbitrary identifier to a filesystem-safe form: ASCII
/// alphanumerics, dash, underscore and dot, with path separators turned
/// into underscores. Never returns an empty string for non-empty input.
pub fn safe_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => out.push(c),
            '/' | '\\' | ' ' => out.push('_'),
            _ => { /* dropped */ }
        }
    }

    // A name of only dots would escape the resource directory
    let trimmed = out.trim_matches('.').to_string();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Top Level Dataset"), "top-level-dataset");
        assert_eq!(slugify("  spaced  out  "), "spaced-out");
        assert_eq!(slugify("already-slugged"), "already-slugged");
    }

    #[test]
    fn slugify_strips_edges() {
        assert_eq!(slugify("--x--"), "x");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn safe_filename_removes_separators() {
        assert_eq!(safe_filename("a/b/c"), "a_b_c");
        assert_eq!(safe_filename("model name.gguf"), "model_name.gguf");
        assert_eq!(safe_filename("..."), "_");
    }
}
