/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{config::Host, sweep::PointReport};
use anyhow::Context;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Describes one `bench` run. Written next to the result logs so a set of logs can be traced back
/// to the cluster and sweep that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub servers: usize,
    pub hosts: Vec<Host>,
    pub provisioned: bool,
    pub waits_us: Vec<u64>,
    pub throughput_log: PathBuf,
    pub latency_log: PathBuf,
    #[serde(default)]
    pub points: Vec<PointReport>,
}
impl RunManifest {
    pub fn begin(
        hosts: &[Host],
        provisioned: bool,
        waits_us: &[u64],
        throughput_log: &Path,
        latency_log: &Path,
    ) -> Self {
        Self {
            run_id: nanoid!(5),
            started_at: Utc::now(),
            finished_at: None,
            servers: hosts.len(),
            hosts: hosts.to_vec(),
            provisioned,
            waits_us: waits_us.to_vec(),
            throughput_log: throughput_log.to_path_buf(),
            latency_log: latency_log.to_path_buf(),
            points: vec![],
        }
    }

    pub fn file_name(servers: usize) -> String {
        format!("run_res{servers}.json")
    }

    pub fn finish(&mut self, points: Vec<PointReport>) {
        self.finished_at = Some(Utc::now());
        self.points = points;
    }

    /// Writes the manifest into `dir`, replacing the manifest of a previous run with the same
    /// server count.
    pub fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(Self::file_name(self.servers));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).context(format!("Unable to write run manifest {}", path.display()))?;
        Ok(path)
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .context(format!("Unable to read run manifest {}", path.display()))?;
        serde_json::from_str(&json).context(format!("Invalid run manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::LatencyOutcome;

    #[test]
    fn manifest_is_written_and_read_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let hosts = vec![Host::new("node1", "10.0.0.1:5254"), Host::new("node2", "10.0.0.2:5254")];
        let mut manifest = RunManifest::begin(
            &hosts,
            true,
            &[0, 2500],
            &dir.path().join("rps_res2"),
            &dir.path().join("lat_res2"),
        );
        assert_eq!(manifest.servers, 2);
        assert_eq!(manifest.finished_at, None);

        manifest.finish(vec![PointReport {
            wait_us: 0,
            latency: LatencyOutcome::TimedOut,
            throughput_exited_early: false,
        }]);
        let path = manifest.write(dir.path())?;
        assert_eq!(path, dir.path().join("run_res2.json"));

        let read = RunManifest::read(&path)?;
        assert_eq!(read, manifest);
        assert!(read.finished_at >= Some(read.started_at));
        assert!(fs::read_to_string(&path)?.contains("\"timed_out\""));
        Ok(())
    }
}
