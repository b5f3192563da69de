/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::resolve_binaries;
use crate::{
    clap_args::ClusterArgs,
    config::Config,
    gateway::{command_line, Gateway, Invocation, Redirect},
    provision::{Cluster, ProvisionOptions, Provisioner},
    sandbox::Sandbox,
};
use colored::Colorize;

pub const CONFIG_PREFIX: &str = "smoketest";

#[derive(Debug, Clone)]
pub struct SmokeOptions {
    pub servers: usize,
    pub iterations: u32,
    pub cluster: ClusterArgs,
}

/// Provisions and grows a cluster, then runs the client binary against it `iterations` times.
/// The servers are checked for failures after every client run.
pub async fn run_smoke(config: &Config, options: &SmokeOptions) -> anyhow::Result<()> {
    let cluster = Cluster::new(config.hosts_for(options.servers)?)?;
    let layout = config.layout()?;
    let binaries = resolve_binaries(config, &options.cluster);

    let mut sandbox = Sandbox::enter(Gateway::new(
        config.remote.clone(),
        layout.working_dir.clone(),
    ));

    Provisioner::new(
        &binaries,
        &layout,
        &cluster,
        ProvisionOptions {
            prefix: CONFIG_PREFIX.to_string(),
            shared_fs: options.cluster.sharedfs,
            reconf_opts: options.cluster.reconf.clone(),
        },
    )
    .provision(&mut sandbox, true)
    .await?;

    let command = command_line(&[
        &binaries.client,
        &options.cluster.clientops,
        &cluster.cluster_arg(),
    ]);
    println!(
        "> running {} on localhost over {} iterations",
        command.green(),
        options.iterations
    );

    for i in 1..=options.iterations {
        println!("> client run {}/{}", i, options.iterations);
        sandbox
            .run(
                &Invocation::local(command.as_str())
                    .stdout(Redirect::Parent)
                    .stderr(Redirect::Null),
            )
            .await?;
        sandbox.check_failures()?;
    }

    sandbox.teardown();
    Ok(())
}
