//! Windows system integration: firewall rules, service registration and the
//! external commands they run.
//!
//! Everything shells out to `netsh`, `sc`, `ipconfig` or PowerShell through
//! a [`CommandRunner`], so the output parsers can be tested on captured text.

pub mod firewall;
pub mod service;

use std::future::Future;
use std::io;

use thiserror::Error;
use tokio::process::Command;

pub use firewall::{Direction, Firewall, FirewallAction, FirewallRule, FirewallStatus};
pub use service::{ServiceManager, ServiceState};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Command that does not flash a console window when run from the GUI.
pub fn hidden_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with code {code:?}: {message}")]
    Failed {
        program: String,
        code: Option<i32>,
        message: String,
    },
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`CommandError::Failed`].
    pub fn check(self, program: &str) -> Result<Self, CommandError> {
        if self.success() {
            return Ok(self);
        }
        let message = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(CommandError::Failed {
            program: program.to_string(),
            code: self.code,
            message,
        })
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync + Clone + 'static {
    /// Run `program` to completion and capture its output. A non-zero exit
    /// is not an error at this level.
    fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

/// Runs programs on the host with a hidden console window.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        tracing::debug!(program, ?args, "running command");
        let output = hidden_command(program)
            .args(args)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
