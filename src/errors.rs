/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The provisioning phase a [`HarnessError::Provisioning`] failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Configure,
    Distribute,
    Bootstrap,
    Start,
    Grow,
}
impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ProvisionStep::Configure => "configure",
            ProvisionStep::Distribute => "distribute",
            ProvisionStep::Bootstrap => "bootstrap",
            ProvisionStep::Start => "start",
            ProvisionStep::Grow => "grow",
        };
        write!(f, "{step}")
    }
}

/// Failures the harness distinguishes. Everything else travels as a plain `anyhow::Error` with
/// context attached; callers downcast to this type when they need to tell failures apart.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("command `{command}` on {host} exited with {status}")]
    CommandFailed {
        command: String,
        host: String,
        status: String,
        stderr: String,
    },

    #[error("provisioning failed during {step} step")]
    Provisioning {
        step: ProvisionStep,
        #[source]
        source: BoxError,
    },

    #[error("background process `{command}` on {host} terminated unexpectedly ({status})")]
    BackgroundProcessFailed {
        command: String,
        host: String,
        status: String,
    },

    #[error("malformed sample on line {line}: {content:?}")]
    ParseAnomaly { line: usize, content: String },

    #[error("interrupted")]
    Interrupted,
}
impl HarnessError {
    pub fn provisioning(step: ProvisionStep, err: anyhow::Error) -> anyhow::Error {
        HarnessError::Provisioning {
            step,
            source: err.into(),
        }
        .into()
    }
}

/// Returns true if the error chain bottoms out in a non-zero exit of a foreground command.
pub fn is_command_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::CommandFailed { .. })
    )
}
