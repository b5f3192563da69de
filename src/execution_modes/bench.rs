/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::resolve_binaries;
use crate::{
    clap_args::ClusterArgs,
    config::Config,
    gateway::Gateway,
    manifest::RunManifest,
    provision::{Cluster, ProvisionOptions, Provisioner},
    report::{self, SeriesSpec},
    result_log::ResultLog,
    sandbox::Sandbox,
    sweep::{LatencyOutcome, SweepDriver, SweepPlan},
};
use colored::Colorize;
use tracing::{info, warn};

pub const CONFIG_PREFIX: &str = "benchtest";

#[derive(Debug, Clone, Default)]
pub struct BenchOptions {
    /// Defaults to every configured host.
    pub servers: Option<usize>,
    pub growing: bool,
    pub cluster: ClusterArgs,
}

pub fn throughput_log_name(servers: usize) -> String {
    format!("rps_res{servers}")
}

pub fn latency_log_name(servers: usize) -> String {
    format!("lat_res{servers}")
}

/// Runs the load sweep against the cluster, provisioning it first if `growing` is set. Without
/// `growing` the cluster is expected to be running already.
pub async fn run_bench(config: &Config, options: &BenchOptions) -> anyhow::Result<RunManifest> {
    let servers = options.servers.unwrap_or(config.hosts.len());
    let cluster = Cluster::new(config.hosts_for(servers)?)?;
    let layout = config.layout()?;
    let binaries = resolve_binaries(config, &options.cluster);

    let mut sandbox = Sandbox::enter(Gateway::new(
        config.remote.clone(),
        layout.working_dir.clone(),
    ));

    if options.growing {
        let provisioner = Provisioner::new(
            &binaries,
            &layout,
            &cluster,
            ProvisionOptions {
                prefix: CONFIG_PREFIX.to_string(),
                shared_fs: options.cluster.sharedfs,
                reconf_opts: options.cluster.reconf.clone(),
            },
        );
        provisioner.provision(&mut sandbox, true).await?;
    } else {
        info!(
            "Benchmarking the running cluster {}",
            cluster.listen_addresses().join(",")
        );
    }

    let throughput_log =
        ResultLog::create(&layout.results_dir.join(throughput_log_name(cluster.size())))?;
    let latency_log = ResultLog::create(&layout.results_dir.join(latency_log_name(cluster.size())))?;

    let plan = SweepPlan::from_config(config);
    let mut manifest = RunManifest::begin(
        cluster.hosts(),
        options.growing,
        &plan.waits_us,
        throughput_log.path(),
        latency_log.path(),
    );
    manifest.write(&layout.results_dir)?;

    println!(
        "> sweeping {} wait intervals against {} servers",
        plan.waits_us.len().to_string().green(),
        cluster.size().to_string().green()
    );
    let driver = SweepDriver::new(
        &plan,
        &binaries.client,
        &options.cluster.clientops,
        cluster.cluster_arg(),
        &throughput_log,
        &latency_log,
    );
    let points = driver.run(&mut sandbox).await?;

    let timed_out = points
        .iter()
        .filter(|point| point.latency == LatencyOutcome::TimedOut)
        .count();
    if timed_out > 0 {
        warn!("{} of {} latency trials did not complete", timed_out, points.len());
    }

    manifest.finish(points);
    let manifest_path = manifest.write(&layout.results_dir)?;
    sandbox.teardown();

    print_summary(&cluster, &throughput_log, &latency_log);
    println!("> run manifest written to {}", manifest_path.display());
    Ok(manifest)
}

fn print_summary(cluster: &Cluster, throughput_log: &ResultLog, latency_log: &ResultLog) {
    let spec = SeriesSpec {
        label: format!("{} servers", cluster.size()),
        latency_log: latency_log.path().to_path_buf(),
        throughput_log: throughput_log.path().to_path_buf(),
    };

    // the logs are complete at this point, a summary that cannot be built is not a failed run
    match report::reduce_pair(&spec) {
        Ok(Some(series)) => println!("{}", report::render_table(&[series])),
        Ok(None) => {}
        Err(err) => warn!("Unable to summarise the run: {:#}", err),
    }
}
