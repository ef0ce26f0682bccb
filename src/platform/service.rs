//! Registration of Defensiq as an auto-start Windows service through `sc`.

use std::fmt;
use std::path::Path;

use super::{CommandError, CommandRunner, SystemRunner};

const SC: &str = "sc";

pub const SERVICE_NAME: &str = "DefensiqNetworkSecurity";
pub const DISPLAY_NAME: &str = "Defensiq Network Security";
pub const DESCRIPTION: &str = "Ethical network monitoring and security service";

/// Service state as reported by `sc query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
    /// Not installed, or output we could not read.
    Unknown,
}

impl ServiceState {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Stopped,
            2 => Self::StartPending,
            3 => Self::StopPending,
            4 => Self::Running,
            5 => Self::ContinuePending,
            6 => Self::PausePending,
            7 => Self::Paused,
            _ => Self::Unknown,
        }
    }

    /// Parse the `STATE : 4  RUNNING` line of `sc query`.
    pub fn parse(output: &str) -> Self {
        output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("STATE"))
            .filter_map(|rest| rest.trim_start().strip_prefix(':'))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|code| code.parse().ok())
            .map(Self::from_code)
            .next()
            .unwrap_or(Self::Unknown)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::StartPending => "STARTING",
            Self::StopPending => "STOPPING",
            Self::Running => "RUNNING",
            Self::ContinuePending => "CONTINUING",
            Self::PausePending => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installs, removes and controls the service.
#[derive(Clone)]
pub struct ServiceManager<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl Default for ServiceManager<SystemRunner> {
    fn default() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl ServiceManager<SystemRunner> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> ServiceManager<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    async fn sc(&self, args: &[&str]) -> Result<String, CommandError> {
        let output = self.runner.run(SC, args).await?.check(SC)?;
        Ok(output.stdout)
    }

    /// Register `executable` to start at boot in `service` mode.
    pub async fn install(&self, executable: &Path) -> Result<(), CommandError> {
        let bin_path = format!("\"{}\" --mode service", executable.display());
        self.sc(&[
            "create",
            SERVICE_NAME,
            "binPath=",
            &bin_path,
            "DisplayName=",
            DISPLAY_NAME,
            "start=",
            "auto",
        ])
        .await?;

        if let Err(err) = self.sc(&["description", SERVICE_NAME, DESCRIPTION]).await {
            tracing::warn!(error = %err, "service installed without description");
        }
        tracing::info!(service = SERVICE_NAME, executable = ?executable, "service installed");
        Ok(())
    }

    /// Stop the service if it runs, then delete it.
    pub async fn uninstall(&self) -> Result<(), CommandError> {
        if let Err(err) = self.stop().await {
            tracing::debug!(error = %err, "service was not running");
        }
        self.sc(&["delete", SERVICE_NAME]).await?;
        tracing::info!(service = SERVICE_NAME, "service uninstalled");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), CommandError> {
        self.sc(&["start", SERVICE_NAME]).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), CommandError> {
        self.sc(&["stop", SERVICE_NAME]).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<ServiceState, CommandError> {
        let output = self.sc(&["query", SERVICE_NAME]).await?;
        Ok(ServiceState::parse(&output))
    }
}
