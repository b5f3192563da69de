/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use logbench::{
    clap_args::{self, Args, Commands},
    config::Config,
    errors::HarnessError,
    execution_modes::{
        bench::{run_bench, BenchOptions},
        smoke::{run_smoke, SmokeOptions},
    },
    report,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();

    let env_filter = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(env_filter.to_string()))?;

    // dropping the running command tears down its sandbox
    let token = CancellationToken::new();
    let interrupt = token.clone();
    ctrlc::set_handler(move || interrupt.cancel())
        .context("Unable to install the interrupt handler")?;

    tokio::select! {
        res = run(args) => res,
        _ = token.cancelled() => {
            println!("> {}, stopping every tracked process", "interrupted".red());
            Err(HarnessError::Interrupted.into())
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Commands::Init => {
            Config::write_example_to_file(&args.config)?;
            println!(
                "> wrote example config to {}",
                args.config.display().to_string().green()
            );
        }

        Commands::Bench {
            servers,
            growing,
            cluster,
        } => {
            let config = Config::try_from_path(&args.config)?;
            let options = BenchOptions {
                servers,
                growing,
                cluster,
            };
            let manifest = run_bench(&config, &options).await?;
            info!("Finished run {}", manifest.run_id);
        }

        Commands::Smoke {
            servers,
            it,
            cluster,
        } => {
            let config = Config::try_from_path(&args.config)?;
            let options = SmokeOptions {
                servers,
                iterations: it,
                cluster,
            };
            run_smoke(&config, &options).await?;
            println!("> smoke test {}", "passed".green());
        }

        Commands::Reduce { series, json } => {
            let mut reduced = vec![];
            for spec in &series {
                if let Some(series) = report::reduce_pair(spec)? {
                    reduced.push(series);
                }
            }

            println!("{}", report::render_table(&reduced));
            if let Some(path) = json {
                report::write_json(&path, &reduced)?;
            }
        }
    }

    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
