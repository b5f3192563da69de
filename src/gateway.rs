/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The only place in the crate that spawns operating system processes.
//!
//! Local commands are split into POSIX words and executed directly, without a shell, so the PID
//! the OS hands back is the PID of the command itself. Remote commands are handed to the remote
//! shell program (ssh by default) as a single script that first changes into the working
//! directory.

use crate::{
    config::{Host, RemoteShell},
    errors::HarnessError,
};
use anyhow::{anyhow, Context};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    process::Stdio,
};
use subprocess::{Exec, ExitStatus, NullFile, Popen, Redirection};
use tracing::debug;

const NO_BACKGROUND_CAPTURE: &str =
    "background commands cannot capture output, redirect it to a file instead";

/// Where a stream of a spawned command goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    Null,
    Parent,
    /// Collected and returned in [`Completed`]. Only valid for foreground commands.
    Capture,
    Append(PathBuf),
    Truncate(PathBuf),
}
impl Redirect {
    fn open(path: &Path, append: bool) -> anyhow::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options
            .open(path)
            .context(format!("Unable to open {} for redirection", path.display()))
    }

    fn to_stdio(&self) -> anyhow::Result<Stdio> {
        let stdio = match self {
            Redirect::Null => Stdio::null(),
            Redirect::Parent => Stdio::inherit(),
            Redirect::Capture => Stdio::piped(),
            Redirect::Append(path) => Stdio::from(Redirect::open(path, true)?),
            Redirect::Truncate(path) => Stdio::from(Redirect::open(path, false)?),
        };
        Ok(stdio)
    }

    fn background_file(&self) -> anyhow::Result<File> {
        match self {
            Redirect::Append(path) => Redirect::open(path, true),
            Redirect::Truncate(path) => Redirect::open(path, false),
            _ => Err(anyhow!("{:?} does not redirect to a file", self)),
        }
    }
}

/// A command together with where to run it and where its output goes.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub command: String,
    pub host: Option<&'a Host>,
    pub stdout: Redirect,
    pub stderr: Redirect,
}
impl<'a> Invocation<'a> {
    pub fn local(command: impl Into<String>) -> Self {
        Self::at(None, command)
    }

    pub fn on(host: &'a Host, command: impl Into<String>) -> Self {
        Self::at(Some(host), command)
    }

    pub fn at(host: Option<&'a Host>, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            host,
            stdout: Redirect::Capture,
            stderr: Redirect::Capture,
        }
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    pub fn host_name(&self) -> String {
        self.host
            .map(|host| host.connect.clone())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// The result of a foreground command that exited successfully. `stdout` is empty unless it was
/// redirected to [`Redirect::Capture`].
#[derive(Debug)]
pub struct Completed {
    pub status: std::process::ExitStatus,
    pub stdout: String,
}

/// A freshly spawned background command. Ownership passes to the [`crate::sandbox::Sandbox`].
#[derive(Debug)]
pub struct Background {
    pub popen: Popen,
    /// Remote file holding the PID of the remote command, if the command runs on another host.
    pub remote_pid_file: Option<String>,
}

/// Quotes a single word for a POSIX shell.
pub fn quote(word: &str) -> anyhow::Result<String> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|err| anyhow!("Unable to quote {:?} for the shell: {:?}", word, err))
}

/// Joins command parts with single spaces, skipping empty parts such as unset option strings.
pub fn command_line(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct Gateway {
    remote: RemoteShell,
    working_dir: PathBuf,
}
impl Gateway {
    pub fn new(remote: RemoteShell, working_dir: PathBuf) -> Self {
        Self {
            remote,
            working_dir,
        }
    }

    /// Builds the argument vector for `command`. Local commands are split into POSIX words;
    /// remote commands become `<remote shell> <options> <host> "cd <dir> && <command>"`. When
    /// `pid_file` is given the remote script records its PID there and `exec`s the command so
    /// that the recorded PID is the command's own.
    pub fn argv(
        &self,
        command: &str,
        host: Option<&Host>,
        pid_file: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        match host {
            None => {
                // break command string into POSIX words
                let words = shlex::split(command)
                    .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {command}"))?;
                if words.is_empty() {
                    return Err(anyhow!("Empty command"));
                }
                Ok(words)
            }

            Some(host) => {
                let dir = quote(&self.working_dir.to_string_lossy())?;
                let script = match pid_file {
                    Some(pid_file) => format!(
                        "cd {dir} && echo $$ > {} && exec {command}",
                        quote(pid_file)?
                    ),
                    None => format!("cd {dir} && {command}"),
                };

                let mut argv = vec![self.remote.program.clone()];
                argv.extend(self.remote.options.iter().cloned());
                argv.push(host.connect.clone());
                argv.push(script);
                Ok(argv)
            }
        }
    }

    /// Runs a command in the foreground and waits for it to finish. A non-zero exit status is
    /// returned as [`HarnessError::CommandFailed`].
    pub async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<Completed> {
        let argv = self.argv(&invocation.command, invocation.host, None)?;
        let (program, args) = argv.split_first().context("Empty command")?;

        debug!(
            "Running `{}` on {} in the foreground",
            invocation.command,
            invocation.host_name()
        );
        // only streams set to `Redirect::Capture` are piped and collected
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(invocation.stdout.to_stdio()?)
            .stderr(invocation.stderr.to_stdio()?)
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to run {program}"))?;
        let output = child
            .wait_with_output()
            .await
            .context(format!("Failed to wait for {program}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(Completed {
                status: output.status,
                stdout,
            })
        } else {
            let status = match output.status.code() {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_string(),
            };
            Err(HarnessError::CommandFailed {
                command: invocation.command.clone(),
                host: invocation.host_name(),
                status,
                stderr,
            }
            .into())
        }
    }

    /// Spawns a command in the background and returns immediately. The caller owns the returned
    /// handle and is responsible for terminating it.
    pub fn spawn(&self, invocation: &Invocation<'_>) -> anyhow::Result<Background> {
        let remote_pid_file = invocation
            .host
            .map(|_| format!(".logbench-{}.pid", nanoid::nanoid!(8, &nanoid::alphabet::SAFE)));
        let argv = self.argv(
            &invocation.command,
            invocation.host,
            remote_pid_file.as_deref(),
        )?;
        let (program, args) = argv.split_first().context("Empty command")?;

        debug!(
            "Running `{}` on {} in the background",
            invocation.command,
            invocation.host_name()
        );
        let exec = Exec::cmd(program)
            .args(args)
            .cwd(&self.working_dir)
            .stdin(NullFile);

        let exec = match &invocation.stdout {
            Redirect::Null => exec.stdout(NullFile),
            Redirect::Parent => exec,
            Redirect::Capture => return Err(anyhow!(NO_BACKGROUND_CAPTURE)),
            file => exec.stdout(Redirection::File(file.background_file()?)),
        };
        let exec = match &invocation.stderr {
            Redirect::Null => exec.stderr(NullFile),
            Redirect::Parent => exec,
            Redirect::Capture => return Err(anyhow!(NO_BACKGROUND_CAPTURE)),
            file => exec.stderr(Redirection::File(file.background_file()?)),
        };

        let popen = exec
            .detached()
            .popen()
            .context(format!(
                "Failed to spawn background process, command: {}",
                invocation.command
            ))?;

        Ok(Background {
            popen,
            remote_pid_file,
        })
    }

    /// Copies a local file into the working directory of `host` with the configured copy program.
    pub async fn copy_to(&self, host: &Host, file: &Path) -> anyhow::Result<Completed> {
        let command = format!(
            "{} {} {}:{}",
            quote(&self.remote.copy)?,
            quote(&file.to_string_lossy())?,
            host.connect,
            quote(&self.working_dir.to_string_lossy())?
        );
        self.run(&Invocation::local(command).stdout(Redirect::Null))
            .await
    }

    /// Kills the remote command whose PID was recorded in `pid_file` and removes the file. Runs
    /// synchronously so it can be used during teardown.
    pub fn kill_remote(&self, host: &Host, pid_file: &str) -> anyhow::Result<ExitStatus> {
        let pid_file = quote(pid_file)?;
        let command = format!(
            "test -f {pid_file} && kill $(cat {pid_file}) 2>/dev/null; rm -f {pid_file}"
        );
        let argv = self.argv(&command, Some(host), None)?;
        let (program, args) = argv.split_first().context("Empty command")?;

        Exec::cmd(program)
            .args(args)
            .cwd(&self.working_dir)
            .stdin(NullFile)
            .stdout(NullFile)
            .stderr(NullFile)
            .join()
            .context(format!("Failed to kill remote process on {host}"))
    }
}
