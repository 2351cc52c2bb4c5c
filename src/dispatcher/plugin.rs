//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Plugin directory handling: locating a plugin, preparing its setup
//! command and building the `python main.py` invocation.
//!
//! Plugins are executable directories on the host filesystem with at
//! minimum a `main.py`, optionally `index.json`, a setup script,
//! `pyproject.toml` or `requirements.txt`.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use log::warn;
use serde_json::Value;

use crate::util::shell;

/// Resolve the setup command for a plugin directory.
///
/// The setup script named by `index.json`'s `setup-script` key wins
/// (default `setup.sh`); it gets CRLF-normalized and marked executable.
/// Without one, `pyproject.toml` or `requirements.txt` installs into the
/// per-job venv instead.
pub fn resolve_setup_command(plugin_dir: &Path) -> Result<Option<String>> {
    let script_name = read_setup_script_name(plugin_dir);
    let mut script_path = plugin_dir.join(&script_name);
    if !script_path.exists() {
        script_path = plugin_dir.join("setup.sh");
    }

    if script_path.exists() {
        normalize_line_endings(&script_path);
        make_executable(&script_path);

        let name = script_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(script_name);
        return Ok(Some(format!(
            "cd {} && bash {}",
            shell::quote(&plugin_dir.to_string_lossy()),
            shell::quote(&name)
        )));
    }

    if plugin_dir.join("pyproject.toml").exists() {
        return Ok(Some(format!(
            "cd {} && uv pip install -e .",
            shell::quote(&plugin_dir.to_string_lossy())
        )));
    }
    if plugin_dir.join("requirements.txt").exists() {
        return Ok(Some(format!(
            "cd {} && uv pip install -r requirements.txt",
            shell::quote(&plugin_dir.to_string_lossy())
        )));
    }

    Ok(None)
}

fn read_setup_script_name(plugin_dir: &Path) -> String {
    let index_file = plugin_dir.join("index.json");
    std::fs::read_to_string(&index_file)
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        .and_then(|v| {
            v.get("setup-script")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "setup.sh".to_string())
}

fn normalize_line_endings(script: &Path) {
    let data = match std::fs::read(script) {
        Ok(d) => d,
        Err(_) => return,
    };
    if !data.contains(&b'\r') {
        return;
    }
    let normalized: Vec<u8> = String::from_utf8_lossy(&data)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .into_bytes();
    if let Err(e) = std::fs::write(script, normalized) {
        warn!(
            "Could not normalize line endings of {}: {}",
            script.display(),
            e
        );
    }
}

fn make_executable(script: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(script) {
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        let _ = std::fs::set_permissions(script, permissions);
    }
}

/// `cd <plugin_dir> && python main.py <args...>` with every argument
/// shell-quoted.
pub fn build_main_command(plugin_dir: &Path, args: &[String]) -> String {
    format!(
        "cd {} && python main.py {}",
        shell::quote(&plugin_dir.to_string_lossy()),
        shell::join_quoted(args.iter().map(String::as_str))
    )
}

/// The host-local plugin directory, if it exists.
pub fn find_plugin_dir(plugins_root: &str, plugin_name: &str) -> Option<PathBuf> {
    if plugins_root.contains("://") {
        // Plugins are executed in place; only host-local plugin
        // directories are dispatchable
        return None;
    }
    let dir = Path::new(plugins_root).join(crate::util::slug::safe_filename(plugin_name));
    dir.is_dir().then_some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_script_from_index_json() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("index.json"),
            r#"{"setup-script": "install.sh"}"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("install.sh"), "#!/bin/bash\r\necho hi\r\n").unwrap();

        let cmd = resolve_setup_command(tmp.path()).unwrap().unwrap();
        assert!(cmd.ends_with("bash install.sh"));

        // CRLF got normalized and the script is executable now
        let content = std::fs::read_to_string(tmp.path().join("install.sh")).unwrap();
        assert!(!content.contains('\r'));
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(tmp.path().join("install.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn pyproject_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pyproject.toml"), "[project]\n").unwrap();
        let cmd = resolve_setup_command(tmp.path()).unwrap().unwrap();
        assert!(cmd.contains("uv pip install -e ."));
    }

    #[test]
    fn requirements_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "torch\n").unwrap();
        let cmd = resolve_setup_command(tmp.path()).unwrap().unwrap();
        assert!(cmd.contains("uv pip install -r requirements.txt"));
    }

    #[test]
    fn no_setup_files_means_no_setup() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_setup_command(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn main_command_quotes_arguments() {
        let cmd = build_main_command(
            Path::new("/plugins/eval"),
            &["--name".to_string(), "two words".to_string()],
        );
        assert_eq!(cmd, "cd /plugins/eval && python main.py --name 'two words'");
    }
}
