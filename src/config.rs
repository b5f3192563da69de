/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::errors::HarnessError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

static EXAMPLE_CONFIG: &str = include_str!("templates/logbench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_debug_dir")]
    pub debug_dir: PathBuf,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default)]
    pub binaries: Binaries,
    #[serde(default)]
    pub remote: RemoteShell,
    #[serde(rename(serialize = "host", deserialize = "host"), default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub throughput: ThroughputTrial,
    #[serde(default)]
    pub latency: LatencyTrial,
}
impl Config {
    /// Writes the bundled example configuration to `path`. Fails if the file already exists.
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create config file {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| HarnessError::Config(format!("TOML parsing error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            return Err(HarnessError::Config("at least one [[host]] is required".to_string()).into());
        }
        if self.sweep.waits_us.is_empty() {
            return Err(HarnessError::Config("sweep.waits_us must not be empty".to_string()).into());
        }
        if let Some(host) = self
            .hosts
            .iter()
            .find(|host| host.connect.trim().is_empty() || host.listen.trim().is_empty())
        {
            return Err(HarnessError::Config(format!(
                "host entries need both a connect and a listen address, found {:?}",
                host
            ))
            .into());
        }
        self.sweep.validate()
    }

    /// Returns the first `servers` hosts. Asking for more servers than there are hosts is not an
    /// error: the count is capped to the number of configured hosts.
    pub fn hosts_for(&self, servers: usize) -> anyhow::Result<Vec<Host>> {
        if servers == 0 {
            return Err(HarnessError::Config("number of servers must be at least 1".to_string()).into());
        }
        if servers > self.hosts.len() {
            warn!(
                "Number of servers in config file: {}, using {} servers instead of {}",
                self.hosts.len(),
                self.hosts.len(),
                servers
            );
        }
        Ok(self.hosts.iter().take(servers).cloned().collect())
    }

    /// Resolves every configured directory to an absolute path. Relative directories are taken
    /// relative to the working directory, which is itself taken relative to the current
    /// directory.
    pub fn layout(&self) -> anyhow::Result<Layout> {
        let working_dir = if self.working_dir.is_absolute() {
            self.working_dir.clone()
        } else {
            std::env::current_dir()
                .context("Unable to read the current directory")?
                .join(&self.working_dir)
        };

        Ok(Layout {
            results_dir: working_dir.join(&self.results_dir),
            debug_dir: working_dir.join(&self.debug_dir),
            storage_dir: working_dir.join(&self.storage_dir),
            working_dir,
        })
    }
}

/// Absolute locations of everything a run writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub working_dir: PathBuf,
    pub results_dir: PathBuf,
    pub debug_dir: PathBuf,
    pub storage_dir: PathBuf,
}

/// A cluster machine: the address the harness connects to, and the address the server listens
/// on inside the cluster.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Host {
    pub connect: String,
    pub listen: String,
}
impl Host {
    pub fn new(connect: &str, listen: &str) -> Self {
        Self {
            connect: connect.to_string(),
            listen: listen.to_string(),
        }
    }
}
impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.connect)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Binaries {
    pub server: String,
    pub client: String,
    pub reconfigure: String,
}
impl Default for Binaries {
    fn default() -> Self {
        Self {
            server: "build/LogCabin".to_string(),
            client: "build/Examples/Benchmark".to_string(),
            reconfigure: "build/Examples/Reconfigure".to_string(),
        }
    }
}

/// The program used to reach remote hosts, e.g. `ssh -o BatchMode=yes <host> <script>`, and the
/// program that copies files to them, called as `<copy> <file> <host>:<dir>`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RemoteShell {
    pub program: String,
    pub options: Vec<String>,
    pub copy: String,
}
impl Default for RemoteShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            copy: "scp".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Sleep for the warm-up interval.
    Fixed,
    /// Wait until the throughput trial writes its first sample, bounded by the readiness timeout.
    LogActivity,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    pub waits_us: Vec<u64>,
    pub warmup_secs: f64,
    pub cooldown_secs: f64,
    pub readiness: Readiness,
    pub readiness_timeout_secs: f64,
}
impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            waits_us: vec![0, 2500, 5000, 10000, 25000, 50000, 75000, 100000],
            warmup_secs: 1.0,
            cooldown_secs: 6.0,
            readiness: Readiness::Fixed,
            readiness_timeout_secs: 10.0,
        }
    }
}
impl SweepConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (key, secs) in [
            ("warmup_secs", self.warmup_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("readiness_timeout_secs", self.readiness_timeout_secs),
        ] {
            if let Err(err) = Duration::try_from_secs_f64(secs) {
                return Err(HarnessError::Config(format!(
                    "sweep.{key} must be a non-negative number of seconds, found {secs}: {err}"
                ))
                .into());
            }
        }
        Ok(())
    }

    // the accessors never panic, durations that fail validation read as zero

    pub fn warmup(&self) -> Duration {
        Duration::try_from_secs_f64(self.warmup_secs).unwrap_or_default()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_secs).unwrap_or_default()
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.readiness_timeout_secs).unwrap_or_default()
    }
}

/// Open-loop trial: many threads, no timeout, request spacing taken from the sweep point.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ThroughputTrial {
    pub threads: u32,
    pub writes: u64,
    pub size: u32,
    pub timeout_secs: u64,
}
impl Default for ThroughputTrial {
    fn default() -> Self {
        Self {
            threads: 250,
            writes: 1_600_000,
            size: 1024,
            timeout_secs: 0,
        }
    }
}

/// Closed-loop trial: a single requester with a fixed wait, bounded by a timeout.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LatencyTrial {
    pub threads: u32,
    pub writes: u64,
    pub size: u32,
    pub wait_us: u64,
    pub timeout_secs: u64,
}
impl Default for LatencyTrial {
    fn default() -> Self {
        Self {
            threads: 1,
            writes: 100_000,
            size: 1024,
            wait_us: 500_000,
            timeout_secs: 15,
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_debug_dir() -> PathBuf {
    PathBuf::from("debug")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("teststorage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn can_load_config_file() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/logbench.success.toml"))?;
        assert_eq!(cfg.hosts.len(), 3);
        assert_eq!(cfg.hosts[0], Host::new("node1", "192.168.1.1:5254"));
        assert_eq!(cfg.sweep.waits_us, vec![0, 100, 1000]);
        assert_eq!(cfg.sweep.readiness, Readiness::LogActivity);
        assert_eq!(cfg.throughput.threads, 64);
        Ok(())
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/logbench.minimal.toml"))?;
        assert_eq!(cfg.binaries, Binaries::default());
        assert_eq!(cfg.remote, RemoteShell::default());
        assert_eq!(cfg.sweep, SweepConfig::default());
        assert_eq!(cfg.throughput, ThroughputTrial::default());
        assert_eq!(cfg.latency.wait_us, 500_000);
        assert_eq!(cfg.latency.timeout_secs, 15);
        assert_eq!(cfg.storage_dir, PathBuf::from("teststorage"));
        Ok(())
    }

    #[test]
    fn unrepresentable_durations_are_rejected() {
        for value in ["inf", "-inf", "nan", "-1.0", "1e300"] {
            let config = format!(
                "[[host]]\nconnect = \"a\"\nlisten = \"10.0.0.1:5254\"\n\n[sweep]\nwarmup_secs = {value}\n"
            );
            let err = Config::try_from_str(&config).expect_err("duration should be rejected");
            match err.downcast_ref::<HarnessError>() {
                Some(HarnessError::Config(message)) => assert!(message.contains("warmup_secs")),
                other => panic!("unexpected error {:?}", other),
            }
        }

        let sweep = SweepConfig {
            cooldown_secs: f64::INFINITY,
            ..SweepConfig::default()
        };
        assert_eq!(sweep.cooldown(), Duration::ZERO);
    }

    #[test]
    fn partial_trial_sections_keep_remaining_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(
            r#"
            [[host]]
            connect = "a"
            listen = "10.0.0.1:5254"

            [latency]
            timeout_secs = 30
            "#,
        )?;
        assert_eq!(cfg.latency.timeout_secs, 30);
        assert_eq!(cfg.latency.writes, 100_000);
        Ok(())
    }

    #[test]
    fn config_without_hosts_is_rejected() {
        let res = Config::try_from_path(Path::new("./fixtures/logbench.no_hosts.toml"));
        let err = res.expect_err("config without hosts should not load");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Config(_))
        ));
    }

    #[test]
    fn example_config_is_valid() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        assert!(!cfg.hosts.is_empty());
        Ok(())
    }

    #[test]
    fn example_config_is_not_overwritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logbench.toml");
        Config::write_example_to_file(&path)?;
        assert!(Config::write_example_to_file(&path).is_err());
        Ok(())
    }

    #[test]
    fn server_count_is_capped_to_hosts() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/logbench.success.toml"))?;
        assert_eq!(cfg.hosts_for(5)?.len(), 3);
        assert_eq!(cfg.hosts_for(2)?, cfg.hosts[..2].to_vec());
        assert!(cfg.hosts_for(0).is_err());
        Ok(())
    }

    #[test]
    fn layout_is_absolute() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/logbench.minimal.toml"))?;
        let layout = cfg.layout()?;
        assert!(layout.working_dir.is_absolute());
        assert_eq!(layout.debug_dir, layout.working_dir.join("debug"));
        assert_eq!(layout.results_dir, layout.working_dir.join("results"));
        Ok(())
    }
}
