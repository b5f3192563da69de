/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Host,
    errors::HarnessError,
    gateway::{Completed, Gateway, Invocation},
};
use colored::Colorize;
use std::time::Duration;
use subprocess::{ExitStatus, Popen};
use tracing::{debug, info, warn};

/// How long a tracked process gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// Identifies a process tracked by a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessId(usize);

/// A background process owned by a sandbox.
#[derive(Debug)]
pub struct TrackedProcess {
    id: ProcessId,
    command: String,
    host: Option<Host>,
    popen: Popen,
    remote_pid_file: Option<String>,
    ignore_failures: bool,
}
impl TrackedProcess {
    pub fn host_name(&self) -> String {
        self.host
            .as_ref()
            .map(|host| host.connect.clone())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn pid(&self) -> Option<u32> {
        self.popen.pid()
    }
}

/// Owns every background process started during a run.
///
/// All tracked processes are terminated when the sandbox is dropped, so leaving the scope
/// through `?`, a panic or a cancelled future never leaves servers or load generators running.
pub struct Sandbox {
    gateway: Gateway,
    processes: Vec<TrackedProcess>,
    next_id: usize,
}
impl Sandbox {
    pub fn enter(gateway: Gateway) -> Self {
        Self {
            gateway,
            processes: vec![],
            next_id: 0,
        }
    }

    /// Runs a command in the foreground. Foreground commands are not tracked.
    pub async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<Completed> {
        self.gateway.run(invocation).await
    }

    /// Copies a local file into the working directory of `host`. Not tracked.
    pub async fn copy_to(&self, host: &Host, file: &std::path::Path) -> anyhow::Result<Completed> {
        self.gateway.copy_to(host, file).await
    }

    /// Starts a command in the background and tracks it. [`Sandbox::check_failures`] reports it
    /// if it exits with a non-zero status.
    pub fn spawn(&mut self, invocation: &Invocation<'_>) -> anyhow::Result<ProcessId> {
        self.track(invocation, false)
    }

    /// Like [`Sandbox::spawn`], but the process is never reported by
    /// [`Sandbox::check_failures`]. Use for processes that are expected to be terminated.
    pub fn spawn_ignoring_failures(&mut self, invocation: &Invocation<'_>) -> anyhow::Result<ProcessId> {
        self.track(invocation, true)
    }

    fn track(&mut self, invocation: &Invocation<'_>, ignore_failures: bool) -> anyhow::Result<ProcessId> {
        let background = self.gateway.spawn(invocation)?;
        let id = ProcessId(self.next_id);
        self.next_id += 1;

        self.processes.push(TrackedProcess {
            id,
            command: invocation.command.clone(),
            host: invocation.host.cloned(),
            popen: background.popen,
            remote_pid_file: background.remote_pid_file,
            ignore_failures,
        });
        Ok(id)
    }

    /// Polls every tracked process and fails with [`HarnessError::BackgroundProcessFailed`] for
    /// the first one found to have exited with a non-zero status.
    pub fn check_failures(&mut self) -> anyhow::Result<()> {
        for proc in self.processes.iter_mut().filter(|proc| !proc.ignore_failures) {
            if let Some(status) = proc.popen.poll() {
                if !status.success() {
                    return Err(HarnessError::BackgroundProcessFailed {
                        command: proc.command.clone(),
                        host: proc.host_name(),
                        status: describe(status),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Terminates a tracked process and stops tracking it. Returns the exit status if the process
    /// had already exited on its own before it was terminated.
    ///
    /// The grace period is awaited on the runtime, so other tasks (ctrl-c handling included) keep
    /// running while the process shuts down.
    pub async fn reap(&mut self, id: ProcessId) -> Option<ExitStatus> {
        let index = self.processes.iter().position(|proc| proc.id == id)?;
        let mut proc = self.processes.remove(index);
        let exited_before = proc.popen.poll();

        print!("> stopping {} on {}", proc.command.green(), proc.host_name());
        if send_terminate(&self.gateway, &mut proc) {
            let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
            let mut status = proc.popen.poll();
            while status.is_none() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(TERMINATE_POLL).await;
                status = proc.popen.poll();
            }
            match status {
                Some(status) => debug!("`{}` exited with {}", proc.command, describe(status)),
                None => force_kill(&mut proc),
            }
        }
        println!("\t{}", "✓".green());

        exited_before
    }

    /// Returns true while the tracked process has not exited.
    pub fn is_running(&mut self, id: ProcessId) -> bool {
        self.processes
            .iter_mut()
            .find(|proc| proc.id == id)
            .map(|proc| proc.popen.poll().is_none())
            .unwrap_or(false)
    }

    /// Returns the number of tracked processes, whether or not they are still running.
    pub fn tracked(&self) -> usize {
        self.processes.len()
    }

    pub fn processes(&self) -> &[TrackedProcess] {
        &self.processes
    }

    /// Terminates every tracked process. Called automatically when the sandbox is dropped.
    pub fn teardown(&mut self) {
        if self.processes.is_empty() {
            return;
        }

        info!("Terminating {} tracked process(es)", self.processes.len());
        for mut proc in self.processes.drain(..) {
            terminate(&self.gateway, &mut proc);
        }
    }
}
impl Drop for Sandbox {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn describe(status: ExitStatus) -> String {
    match status {
        ExitStatus::Exited(code) => format!("exit code {code}"),
        ExitStatus::Signaled(signal) => format!("signal {signal}"),
        ExitStatus::Other(other) => format!("status {other}"),
        ExitStatus::Undetermined => "undetermined status".to_string(),
    }
}

/// Kills the remote side of a process and sends SIGTERM to the local handle. Returns true if the
/// local handle was still running and has to be waited for.
fn send_terminate(gateway: &Gateway, proc: &mut TrackedProcess) -> bool {
    // the local handle of a remote process belongs to the remote shell, so the remote command
    // has to be killed through its pid file
    if let (Some(host), Some(pid_file)) = (&proc.host, &proc.remote_pid_file) {
        if let Err(err) = gateway.kill_remote(host, pid_file) {
            warn!("Failed to kill `{}` on {}\n{}", proc.command, host, err);
        }
    }

    if proc.popen.poll().is_some() {
        return false;
    }
    if let Err(err) = proc.popen.terminate() {
        warn!("Failed to terminate `{}`: {}", proc.command, err);
    }
    true
}

fn force_kill(proc: &mut TrackedProcess) {
    warn!("`{}` ignored SIGTERM, killing it", proc.command);
    if let Err(err) = proc.popen.kill() {
        warn!("Failed to kill `{}`: {}", proc.command, err);
    }
    if let Err(err) = proc.popen.wait() {
        warn!("Failed to wait for `{}`: {}", proc.command, err);
    }
}

/// Blocking variant of [`Sandbox::reap`] used during teardown, where no runtime may be available.
fn terminate(gateway: &Gateway, proc: &mut TrackedProcess) {
    print!("> stopping {} on {}", proc.command.green(), proc.host_name());

    if send_terminate(gateway, proc) {
        match proc.popen.wait_timeout(TERMINATE_GRACE) {
            Ok(Some(status)) => debug!("`{}` exited with {}", proc.command, describe(status)),
            Ok(None) | Err(_) => force_kill(proc),
        }
    }

    println!("\t{}", "✓".green());
}
