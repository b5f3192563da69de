/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Binaries, Host, Layout},
    errors::{HarnessError, ProvisionStep},
    gateway::{command_line, quote, Invocation, Redirect},
    sandbox::Sandbox,
};
use anyhow::{anyhow, Context};
use colored::Colorize;
use itertools::Itertools;
use std::{
    fs, io,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// File in the debug directory recording the `--cluster=` argument of the run.
pub const CLUSTER_ARG_FILE: &str = "bench_cluster";
pub const BOOTSTRAP_DEBUG_FILE: &str = "bootstrap_err";

/// The ordered set of hosts making up the cluster. Server ids start at 1 and follow host order.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    hosts: Vec<Host>,
}
impl Cluster {
    pub fn new(hosts: Vec<Host>) -> anyhow::Result<Self> {
        if hosts.is_empty() {
            return Err(HarnessError::Config("a cluster needs at least one host".to_string()).into());
        }
        Ok(Self { hosts })
    }

    pub fn size(&self) -> usize {
        self.hosts.len()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn server_ids(&self) -> RangeInclusive<u32> {
        1..=self.hosts.len() as u32
    }

    pub fn host(&self, server_id: u32) -> Option<&Host> {
        let index = (server_id as usize).checked_sub(1)?;
        self.hosts.get(index)
    }

    pub fn listen_addresses(&self) -> Vec<&str> {
        self.hosts.iter().map(|host| host.listen.as_str()).collect_vec()
    }

    /// The argument passed to every client binary, e.g. `--cluster=10.0.0.1:5254,10.0.0.2:5254`.
    pub fn cluster_arg(&self) -> String {
        format!("--cluster={}", self.listen_addresses().join(","))
    }
}

/// Configuration of a single server.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub server_id: u32,
    pub listen_address: String,
    pub storage_path: PathBuf,
    /// User supplied settings appended verbatim.
    pub overrides: Option<String>,
}
impl NodeConfig {
    pub fn file_name(prefix: &str, server_id: u32) -> String {
        format!("{prefix}-{server_id}.conf")
    }

    pub fn render(&self) -> String {
        let mut storage_path = self.storage_path.to_string_lossy().to_string();
        if !storage_path.ends_with('/') {
            storage_path.push('/');
        }

        let mut rendered = format!(
            "serverId = {}\nlistenAddresses = {}\nstoragePath = {}\n\n",
            self.server_id, self.listen_address, storage_path
        );
        if let Some(overrides) = &self.overrides {
            rendered.push_str(overrides);
        }
        rendered
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Prefix of generated config files. `<prefix>.conf` in the working directory, if present,
    /// is appended to every generated config.
    pub prefix: String,
    pub shared_fs: bool,
    /// Extra options passed to the reconfiguration binary.
    pub reconf_opts: String,
}

/// Builds and starts a cluster.
pub struct Provisioner<'a> {
    binaries: &'a Binaries,
    layout: &'a Layout,
    cluster: &'a Cluster,
    options: ProvisionOptions,
}
impl<'a> Provisioner<'a> {
    pub fn new(
        binaries: &'a Binaries,
        layout: &'a Layout,
        cluster: &'a Cluster,
        options: ProvisionOptions,
    ) -> Self {
        Self {
            binaries,
            layout,
            cluster,
            options,
        }
    }

    /// Runs every provisioning step in order. Any failure aborts provisioning and is reported as
    /// [`HarnessError::Provisioning`]; nothing is retried.
    pub async fn provision(&self, sandbox: &mut Sandbox, grow: bool) -> anyhow::Result<()> {
        let config_files = self
            .configure()
            .map_err(|err| HarnessError::provisioning(ProvisionStep::Configure, err))?;

        self.distribute(sandbox, &config_files)
            .await
            .map_err(|err| HarnessError::provisioning(ProvisionStep::Distribute, err))?;

        self.bootstrap(sandbox)
            .await
            .map_err(|err| HarnessError::provisioning(ProvisionStep::Bootstrap, err))?;

        self.start(sandbox)
            .map_err(|err| HarnessError::provisioning(ProvisionStep::Start, err))?;

        if grow {
            self.grow(sandbox)
                .await
                .map_err(|err| HarnessError::provisioning(ProvisionStep::Grow, err))?;
        }

        Ok(())
    }

    /// Recreates the debug directory and writes one config file per server.
    pub fn configure(&self) -> anyhow::Result<Vec<PathBuf>> {
        self.reset_debug_dir()?;
        self.write_node_configs()
    }

    fn reset_debug_dir(&self) -> anyhow::Result<()> {
        remove_dir_if_exists(&self.layout.debug_dir)?;
        fs::create_dir_all(&self.layout.debug_dir).context(format!(
            "Unable to create debug directory {}",
            self.layout.debug_dir.display()
        ))?;
        fs::write(
            self.layout.debug_dir.join(CLUSTER_ARG_FILE),
            format!("{}\n", self.cluster.cluster_arg()),
        )?;
        Ok(())
    }

    pub fn node_configs(&self) -> Vec<NodeConfig> {
        // the override file is optional
        let override_path = self
            .layout
            .working_dir
            .join(format!("{}.conf", self.options.prefix));
        let overrides = fs::read_to_string(&override_path).ok();
        if overrides.is_some() {
            debug!("Appending {} to every node config", override_path.display());
        }

        self.cluster
            .hosts()
            .iter()
            .zip(self.cluster.server_ids())
            .map(|(host, server_id)| NodeConfig {
                server_id,
                listen_address: host.listen.clone(),
                storage_path: self.layout.storage_dir.clone(),
                overrides: overrides.clone(),
            })
            .collect_vec()
    }

    /// Writes a config file per server into the working directory and returns their paths in
    /// server id order.
    pub fn write_node_configs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = vec![];
        for node_config in self.node_configs() {
            let path = self
                .layout
                .working_dir
                .join(NodeConfig::file_name(&self.options.prefix, node_config.server_id));
            fs::write(&path, node_config.render())
                .context(format!("Unable to write node config {}", path.display()))?;
            paths.push(path);
        }
        Ok(paths)
    }

    /// Copies the config files to their hosts and removes storage left over from previous runs.
    pub async fn distribute(&self, sandbox: &Sandbox, config_files: &[PathBuf]) -> anyhow::Result<()> {
        if self.options.shared_fs {
            return remove_dir_if_exists(&self.layout.storage_dir);
        }

        println!("> copying config files to remote servers and removing previous storage");
        let storage_dir = quote(&self.layout.storage_dir.to_string_lossy())?;
        for (host, config_file) in self.cluster.hosts().iter().zip(config_files) {
            sandbox.copy_to(host, config_file).await?;

            sandbox
                .run(&Invocation::on(host, format!("rm -rf {storage_dir}")).stdout(Redirect::Null))
                .await?;
        }
        Ok(())
    }

    /// Initializes the log of server 1. Must happen exactly once, before any server starts.
    pub async fn bootstrap(&self, sandbox: &Sandbox) -> anyhow::Result<()> {
        let server_id = *self.cluster.server_ids().start();
        let host = self
            .cluster
            .host(server_id)
            .ok_or_else(|| anyhow!("Cluster has no server {server_id}"))?;

        println!("> initializing the log of server {}", server_id.to_string().green());
        let command = format!(
            "{} --bootstrap --config {}",
            self.binaries.server,
            NodeConfig::file_name(&self.options.prefix, server_id)
        );
        sandbox
            .run(
                &Invocation::on(host, command)
                    .stdout(Redirect::Parent)
                    .stderr(Redirect::Truncate(
                        self.layout.debug_dir.join(BOOTSTRAP_DEBUG_FILE),
                    )),
            )
            .await?;
        Ok(())
    }

    /// Starts every server in the background, checking for failures after each start.
    pub fn start(&self, sandbox: &mut Sandbox) -> anyhow::Result<()> {
        for server_id in self.cluster.server_ids() {
            let host = self
                .cluster
                .host(server_id)
                .ok_or_else(|| anyhow!("Cluster has no server {server_id}"))?;
            let command = format!(
                "{} --config {}",
                self.binaries.server,
                NodeConfig::file_name(&self.options.prefix, server_id)
            );

            println!("> starting {} on {}", command.green(), host.listen);
            sandbox.spawn(
                &Invocation::on(host, command)
                    .stdout(Redirect::Parent)
                    .stderr(Redirect::Truncate(
                        self.layout.debug_dir.join(format!("{server_id}err")),
                    )),
            )?;
            sandbox.check_failures()?;
        }
        Ok(())
    }

    /// Sets the cluster membership to every host. Issued at most once per run.
    pub async fn grow(&self, sandbox: &Sandbox) -> anyhow::Result<()> {
        info!("Growing cluster to {} servers", self.cluster.size());
        let command = command_line(&[
            &self.binaries.reconfigure,
            "--verbosity=ERROR",
            &self.cluster.cluster_arg(),
            &self.options.reconf_opts,
            "set",
            &self.cluster.listen_addresses().join(" "),
        ]);

        sandbox
            .run(&Invocation::local(command).stdout(Redirect::Parent))
            .await?;
        Ok(())
    }
}

fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("Unable to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RemoteShell, gateway::Gateway};

    fn hosts(n: usize) -> Vec<Host> {
        (1..=n)
            .map(|i| Host::new(&format!("node{i}"), &format!("10.0.0.{i}:5254")))
            .collect()
    }

    fn layout(dir: &Path) -> Layout {
        Layout {
            working_dir: dir.to_path_buf(),
            results_dir: dir.join("results"),
            debug_dir: dir.join("debug"),
            storage_dir: dir.join("teststorage"),
        }
    }

    fn options(shared_fs: bool) -> ProvisionOptions {
        ProvisionOptions {
            prefix: "benchtest".to_string(),
            shared_fs,
            reconf_opts: String::new(),
        }
    }

    #[test]
    fn cluster_assigns_sequential_ids() -> anyhow::Result<()> {
        let cluster = Cluster::new(hosts(3))?;
        assert_eq!(cluster.server_ids().collect_vec(), vec![1, 2, 3]);
        assert_eq!(cluster.host(1).map(|h| h.connect.as_str()), Some("node1"));
        assert_eq!(cluster.host(3).map(|h| h.connect.as_str()), Some("node3"));
        assert!(cluster.host(0).is_none());
        assert!(cluster.host(4).is_none());
        assert_eq!(
            cluster.cluster_arg(),
            "--cluster=10.0.0.1:5254,10.0.0.2:5254,10.0.0.3:5254"
        );
        Ok(())
    }

    #[test]
    fn empty_cluster_is_rejected() {
        assert!(Cluster::new(vec![]).is_err());
    }

    #[test]
    fn node_config_renders_in_server_format() {
        let node_config = NodeConfig {
            server_id: 2,
            listen_address: "10.0.0.2:5254".to_string(),
            storage_path: PathBuf::from("/home/bench/teststorage"),
            overrides: Some("snapshotMinLogSize = 1024\n".to_string()),
        };
        assert_eq!(
            node_config.render(),
            "serverId = 2\n\
             listenAddresses = 10.0.0.2:5254\n\
             storagePath = /home/bench/teststorage/\n\
             \n\
             snapshotMinLogSize = 1024\n"
        );
    }

    #[test]
    fn writes_one_config_per_server_in_host_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        let binaries = Binaries::default();
        let cluster = Cluster::new(hosts(3))?;
        let provisioner = Provisioner::new(&binaries, &layout, &cluster, options(false));

        let paths = provisioner.configure()?;
        assert_eq!(paths.len(), 3);

        for (i, path) in paths.iter().enumerate() {
            let id = i + 1;
            assert_eq!(path, &dir.path().join(format!("benchtest-{id}.conf")));
            let contents = fs::read_to_string(path)?;
            assert!(contents.starts_with(&format!("serverId = {id}\n")));
            assert!(contents.contains(&format!("listenAddresses = 10.0.0.{id}:5254\n")));
        }

        let cluster_arg = fs::read_to_string(layout.debug_dir.join(CLUSTER_ARG_FILE))?;
        assert_eq!(cluster_arg.trim(), cluster.cluster_arg());
        Ok(())
    }

    #[test]
    fn override_file_is_appended_when_present() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("benchtest.conf"), "electionTimeoutMilliseconds = 500\n")?;
        let layout = layout(dir.path());
        let binaries = Binaries::default();
        let cluster = Cluster::new(hosts(2))?;
        let provisioner = Provisioner::new(&binaries, &layout, &cluster, options(false));

        for node_config in provisioner.node_configs() {
            assert_eq!(
                node_config.overrides.as_deref(),
                Some("electionTimeoutMilliseconds = 500\n")
            );
            assert!(node_config.render().ends_with("\n\nelectionTimeoutMilliseconds = 500\n"));
        }
        Ok(())
    }

    #[test]
    fn debug_dir_is_recreated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        fs::create_dir_all(&layout.debug_dir)?;
        fs::write(layout.debug_dir.join("1err"), "stale")?;

        let binaries = Binaries::default();
        let cluster = Cluster::new(hosts(1))?;
        Provisioner::new(&binaries, &layout, &cluster, options(false)).configure()?;

        assert!(!layout.debug_dir.join("1err").exists());
        assert!(layout.debug_dir.join(CLUSTER_ARG_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn shared_storage_is_removed_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        fs::create_dir_all(layout.storage_dir.join("server1"))?;

        let binaries = Binaries::default();
        let cluster = Cluster::new(hosts(3))?;
        let provisioner = Provisioner::new(&binaries, &layout, &cluster, options(true));
        let sandbox = Sandbox::enter(Gateway::new(RemoteShell::default(), layout.working_dir.clone()));

        provisioner.distribute(&sandbox, &[]).await?;
        assert!(!layout.storage_dir.exists());

        // nothing left to remove is fine
        provisioner.distribute(&sandbox, &[]).await?;
        Ok(())
    }
}
