/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::report::SeriesSpec;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Provision a LogCabin cluster and sweep it with benchmark load", long_about = None)]
pub struct Args {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "logbench.toml")]
    pub config: PathBuf,

    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that talks to the cluster.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// The hosts share a filesystem, so node configs are not copied
    #[arg(long)]
    pub sharedfs: bool,

    /// Extra options passed to the reconfigure binary
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub reconf: String,

    /// Extra options passed to the client binary
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub clientops: String,

    /// Server binary, overrides `binaries.server`
    #[arg(long)]
    pub binary: Option<String>,

    /// Client binary, overrides `binaries.client`
    #[arg(long)]
    pub client: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example logbench.toml to the current directory
    Init,

    /// Sweep the cluster with throughput and latency trials
    Bench {
        /// Number of servers, defaults to every configured host
        #[arg(short, long)]
        servers: Option<usize>,

        /// Provision the cluster and grow it to every server before the sweep
        #[arg(long)]
        growing: bool,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Provision the cluster and run the client binary against it
    Smoke {
        /// Number of servers
        #[arg(short, long, default_value_t = 5)]
        servers: usize,

        /// Number of client runs
        #[arg(long, default_value_t = 1)]
        it: u32,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Reduce pairs of result logs to per-interval statistics
    Reduce {
        /// LABEL=LAT_LOG,RPS_LOG, may be repeated
        #[arg(required = true)]
        series: Vec<SeriesSpec>,

        /// Export the reduced series as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
