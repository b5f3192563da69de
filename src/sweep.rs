/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Config, LatencyTrial, Readiness, ThroughputTrial},
    errors::is_command_failure,
    gateway::{command_line, Invocation, Redirect},
    result_log::ResultLog,
    sandbox::{ProcessId, Sandbox},
};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the driver needs to know about the sweep, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub waits_us: Vec<u64>,
    pub throughput: ThroughputTrial,
    pub latency: LatencyTrial,
    pub warmup: Duration,
    pub cooldown: Duration,
    pub readiness: Readiness,
    pub readiness_timeout: Duration,
}
impl SweepPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            waits_us: config.sweep.waits_us.clone(),
            throughput: config.throughput.clone(),
            latency: config.latency.clone(),
            warmup: config.sweep.warmup(),
            cooldown: config.sweep.cooldown(),
            readiness: config.sweep.readiness,
            readiness_timeout: config.sweep.readiness_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyOutcome {
    Completed,
    /// The latency trial exited non-zero, usually because its own timeout expired.
    TimedOut,
}

/// What happened at a single sweep point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointReport {
    pub wait_us: u64,
    pub latency: LatencyOutcome,
    /// True if the throughput trial exited before the driver stopped it.
    pub throughput_exited_early: bool,
}

/// Runs one throughput and one latency trial per sweep point and records their output in two
/// result logs.
pub struct SweepDriver<'a> {
    plan: &'a SweepPlan,
    client: &'a str,
    client_opts: &'a str,
    cluster_arg: String,
    throughput_log: &'a ResultLog,
    latency_log: &'a ResultLog,
}
impl<'a> SweepDriver<'a> {
    pub fn new(
        plan: &'a SweepPlan,
        client: &'a str,
        client_opts: &'a str,
        cluster_arg: String,
        throughput_log: &'a ResultLog,
        latency_log: &'a ResultLog,
    ) -> Self {
        Self {
            plan,
            client,
            client_opts,
            cluster_arg,
            throughput_log,
            latency_log,
        }
    }

    pub fn throughput_command(&self, wait_us: u64) -> String {
        let trial = &self.plan.throughput;
        command_line(&[
            self.client,
            &format!("--timeout={}", trial.timeout_secs),
            &format!("--writes={}", trial.writes),
            &format!("--size={}", trial.size),
            &format!("--threads={}", trial.threads),
            &format!("--wait={wait_us}"),
            self.client_opts,
            &self.cluster_arg,
        ])
    }

    pub fn latency_command(&self) -> String {
        let trial = &self.plan.latency;
        command_line(&[
            self.client,
            &format!("--writes={}", trial.writes),
            &format!("--size={}", trial.size),
            &format!("--wait={}", trial.wait_us),
            &format!("--threads={}", trial.threads),
            &format!("--timeout={}", trial.timeout_secs),
            self.client_opts,
            &self.cluster_arg,
        ])
    }

    /// Walks the sweep points front to back and terminates both logs with `end`. Every sweep
    /// point runs strictly after the previous one has finished.
    pub async fn run(&self, sandbox: &mut Sandbox) -> anyhow::Result<Vec<PointReport>> {
        let mut reports = vec![];
        for (i, &wait_us) in self.plan.waits_us.iter().enumerate() {
            reports.push(self.run_point(sandbox, wait_us).await?);

            if i + 1 < self.plan.waits_us.len() {
                info!("Cooling down for {:?}", self.plan.cooldown);
                sleep(self.plan.cooldown).await;
            }
        }

        self.throughput_log.finish()?;
        self.latency_log.finish()?;
        Ok(reports)
    }

    async fn run_point(
        &self,
        sandbox: &mut Sandbox,
        wait_us: u64,
    ) -> anyhow::Result<PointReport> {
        println!("> wait with {}us", wait_us.to_string().green());

        self.throughput_log.mark_wait(wait_us)?;
        let baseline = self.throughput_log.len()?;
        let throughput = sandbox.spawn_ignoring_failures(
            &Invocation::local(self.throughput_command(wait_us))
                .stdout(Redirect::Append(self.throughput_log.path().to_path_buf()))
                .stderr(Redirect::Null),
        )?;
        sandbox.check_failures()?;

        self.warm_up(sandbox, throughput, baseline).await?;

        self.latency_log.mark_wait(wait_us)?;
        let latency = match sandbox
            .run(
                &Invocation::local(self.latency_command())
                    .stdout(Redirect::Append(self.latency_log.path().to_path_buf()))
                    .stderr(Redirect::Null),
            )
            .await
        {
            Ok(_) => LatencyOutcome::Completed,
            Err(err) if is_command_failure(&err) => {
                warn!("Latency trial at {}us did not complete: {}", wait_us, err);
                LatencyOutcome::TimedOut
            }
            Err(err) => return Err(err),
        };

        let throughput_exited_early = sandbox.reap(throughput).await.is_some();
        if throughput_exited_early {
            warn!(
                "Throughput trial at {}us exited before the latency trial finished",
                wait_us
            );
        }
        sandbox.check_failures()?;

        Ok(PointReport {
            wait_us,
            latency,
            throughput_exited_early,
        })
    }

    /// Gives the throughput trial time to ramp up before latency is sampled.
    async fn warm_up(
        &self,
        sandbox: &mut Sandbox,
        throughput: ProcessId,
        baseline: u64,
    ) -> anyhow::Result<()> {
        match self.plan.readiness {
            Readiness::Fixed => {
                sleep(self.plan.warmup).await;
            }

            Readiness::LogActivity => {
                let deadline = Instant::now() + self.plan.readiness_timeout;
                loop {
                    if self.throughput_log.len()? > baseline {
                        break;
                    }
                    if !sandbox.is_running(throughput) {
                        warn!("Throughput trial exited during warm-up");
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            "No throughput samples after {:?}, sampling latency anyway",
                            self.plan.readiness_timeout
                        );
                        break;
                    }
                    sleep(READINESS_POLL_INTERVAL).await;
                }
            }
        }
        Ok(())
    }
}
