/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod bench;
pub mod smoke;

use crate::{
    clap_args::ClusterArgs,
    config::{Binaries, Config},
};

/// Binaries from the config file, with the ones given on the command line taking precedence.
fn resolve_binaries(config: &Config, args: &ClusterArgs) -> Binaries {
    let mut binaries = config.binaries.clone();
    if let Some(server) = &args.binary {
        binaries.server = server.clone();
    }
    if let Some(client) = &args.client {
        binaries.client = client.clone();
    }
    binaries
}
