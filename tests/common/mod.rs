/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![allow(dead_code)]

use logbench::config::{Host, Layout, RemoteShell};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use sysinfo::{Pid, System};

/// A remote shell that runs the remote script locally: `sh -c 'eval "$2"' fake-ssh <host> <script>`.
pub fn local_remote_shell() -> RemoteShell {
    RemoteShell {
        program: "sh".to_string(),
        options: vec![
            "-c".to_string(),
            "eval \"$2\"".to_string(),
            "fake-ssh".to_string(),
        ],
        ..RemoteShell::default()
    }
}

pub fn hosts(n: usize) -> Vec<Host> {
    (1..=n)
        .map(|i| Host::new(&format!("node{i}"), &format!("127.0.0.{i}:5254")))
        .collect()
}

pub fn layout(dir: &Path) -> Layout {
    Layout {
        working_dir: dir.to_path_buf(),
        results_dir: dir.join("results"),
        debug_dir: dir.join("debug"),
        storage_dir: dir.join("teststorage"),
    }
}

/// Writes an executable shell script into `dir` and returns its absolute path.
pub fn script(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    let mut permissions = fs::metadata(&path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions)?;
    Ok(path)
}

pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new_all();
    system.refresh_all();
    system.process(Pid::from_u32(pid)).is_some()
}
