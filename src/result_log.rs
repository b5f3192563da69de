/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Append-only result logs.
//!
//! ```text
//! start
//! wait with 0us
//! 240.954     2.1
//! 240.677     2.0
//! wait with 100us
//! 140.954     4.1
//! end
//! ```
//!
//! Data lines are written by the client binary; the harness only writes the `start`, `wait with`
//! and `end` lines.

use anyhow::Context;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

pub const START: &str = "start";
pub const END: &str = "end";
pub const WAIT_MARKER: &str = "wait with";

pub fn wait_marker(wait_us: u64) -> String {
    format!("{WAIT_MARKER} {wait_us}us")
}

/// Extracts the wait interval from a `wait with <N>us` line.
pub fn parse_wait_marker(line: &str) -> Option<u64> {
    let rest = line.trim().strip_prefix(WAIT_MARKER)?.trim();
    rest.strip_suffix("us")
        .unwrap_or(rest)
        .trim()
        .parse::<u64>()
        .ok()
}

#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}
impl ResultLog {
    /// Creates the log, replacing any previous one, and writes the `start` line.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Unable to create results directory {}", parent.display()))?;
        }
        fs::write(path, format!("{START}\n"))
            .context(format!("Unable to create result log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_wait(&self, wait_us: u64) -> anyhow::Result<()> {
        self.append_line(&wait_marker(wait_us))
    }

    pub fn finish(&self) -> anyhow::Result<()> {
        self.append_line(END)
    }

    /// Current size of the log in bytes.
    pub fn len(&self) -> anyhow::Result<u64> {
        Ok(fs::metadata(&self.path)
            .context(format!("Unable to read {}", self.path.display()))?
            .len())
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .context(format!("Unable to open result log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
