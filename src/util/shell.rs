//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

/// Quote a string for safe interpolation into a `bash -c` command line.
///
/// Follows the POSIX single-quote convention: wrap in `'...'` and encode
/// embedded single quotes as `'"'"'`. Strings that are already safe are
/// returned unchanged.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ',' | '@' | '%' | '+'))
    {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quote and join a list of command line arguments.
pub fn join_quoted<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(quote("abc"), "abc");
        assert_eq!(quote("/path/to/file.json"), "/path/to/file.json");
        assert_eq!(quote("--flag=1"), "--flag=1");
    }

    #[test]
    fn empty_and_spaced_strings_are_quoted() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn join_quotes_each_argument() {
        assert_eq!(join_quoted(["--k", "v w"]), "--k 'v w'");
    }
}
