//! Windows Firewall rules through `netsh advfirewall`.
//!
//! Rule changes need administrator rights. Every change is recorded in the
//! event log; failures are logged as errors and returned.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use super::{CommandError, CommandRunner, SystemRunner};
use crate::events::{EventLog, EventType};

const NETSH: &str = "netsh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallAction {
    Allow,
    Block,
}

impl FirewallAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

/// A named firewall rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub direction: Direction,
    pub action: FirewallAction,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: Option<u16>,
    /// `tcp`, `udp` or `any`.
    pub protocol: String,
    pub program: Option<PathBuf>,
}

impl FirewallRule {
    pub fn new(name: impl Into<String>, direction: Direction, action: FirewallAction) -> Self {
        Self {
            name: name.into(),
            direction,
            action,
            remote_ip: None,
            remote_port: None,
            protocol: "any".to_string(),
            program: None,
        }
    }

    /// Outbound block of every connection to `ip`.
    pub fn block_ip(ip: IpAddr) -> Self {
        Self {
            remote_ip: Some(ip),
            ..Self::new(ip_rule_name(ip), Direction::Outbound, FirewallAction::Block)
        }
    }

    /// Outbound block of everything `program` sends.
    pub fn block_program(process_name: &str, program: &Path) -> Self {
        Self {
            program: Some(program.to_path_buf()),
            ..Self::new(
                program_rule_name(process_name),
                Direction::Outbound,
                FirewallAction::Block,
            )
        }
    }

    /// Arguments for `netsh` creating this rule.
    pub fn add_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["advfirewall", "firewall", "add", "rule"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(format!("name={}", self.name));
        args.push(format!("dir={}", self.direction.as_str()));
        args.push(format!("action={}", self.action.as_str()));
        args.push(format!("protocol={}", self.protocol));
        if let Some(ip) = self.remote_ip {
            args.push(format!("remoteip={ip}"));
        }
        if let Some(port) = self.remote_port {
            args.push(format!("remoteport={port}"));
        }
        if let Some(program) = &self.program {
            args.push(format!("program={}", program.display()));
        }
        args
    }
}

/// Rule name used by [`Firewall::block_ip`].
pub fn ip_rule_name(ip: IpAddr) -> String {
    format!("Defensiq_Block_{}", ip.to_string().replace(['.', ':'], "_"))
}

/// Rule name enforcing an app-control block.
pub fn program_rule_name(process_name: &str) -> String {
    format!("Defensiq_App_{process_name}")
}

/// Extract rule names from `netsh advfirewall firewall show rule` output.
pub fn parse_rule_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("Rule Name:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallStatus {
    pub enabled: bool,
    pub raw_output: String,
}

impl FirewallStatus {
    /// Read `netsh advfirewall show currentprofile` output.
    pub fn parse(output: &str) -> Self {
        let enabled = output.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some("State") && parts.next() == Some("ON")
        });
        Self {
            enabled,
            raw_output: output.to_string(),
        }
    }
}

impl fmt::Display for FirewallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.enabled { "ON" } else { "OFF" })
    }
}

/// Windows Firewall manager.
#[derive(Clone)]
pub struct Firewall<R: CommandRunner = SystemRunner> {
    runner: R,
    events: Arc<EventLog>,
}

impl Firewall<SystemRunner> {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self::with_runner(SystemRunner, events)
    }
}

impl<R: CommandRunner> Firewall<R> {
    pub fn with_runner(runner: R, events: Arc<EventLog>) -> Self {
        Self { runner, events }
    }

    async fn netsh(&self, args: &[String]) -> Result<String, CommandError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run(NETSH, &args).await?.check(NETSH)?;
        Ok(output.stdout)
    }

    pub async fn add_rule(&self, rule: &FirewallRule) -> Result<(), CommandError> {
        match self.netsh(&rule.add_args()).await {
            Ok(_) => {
                self.events.log_with(
                    EventType::RuleAdded,
                    format!("Firewall rule added: {}", rule.name),
                    json!({
                        "direction": rule.direction.as_str(),
                        "action": rule.action.as_str(),
                        "remote_ip": rule.remote_ip.map(|ip| ip.to_string()),
                        "remote_port": rule.remote_port,
                        "program": rule.program.as_ref().map(|p| p.display().to_string()),
                    }),
                );
                Ok(())
            }
            Err(err) => {
                self.events.log_with(
                    EventType::ErrorOccurred,
                    format!("Failed to add firewall rule: {err}"),
                    json!({ "rule": rule.name }),
                );
                Err(err)
            }
        }
    }

    pub async fn remove_rule(&self, name: &str) -> Result<(), CommandError> {
        let args = ["advfirewall", "firewall", "delete", "rule"]
            .into_iter()
            .map(String::from)
            .chain(std::iter::once(format!("name={name}")))
            .collect::<Vec<_>>();
        match self.netsh(&args).await {
            Ok(_) => {
                self.events
                    .log(EventType::RuleRemoved, format!("Firewall rule removed: {name}"));
                Ok(())
            }
            Err(err) => {
                self.events.log_with(
                    EventType::ErrorOccurred,
                    format!("Failed to remove firewall rule: {err}"),
                    json!({ "rule": name }),
                );
                Err(err)
            }
        }
    }

    /// Names of all configured rules.
    pub async fn list_rules(&self) -> Result<Vec<String>, CommandError> {
        let args = ["advfirewall", "firewall", "show", "rule", "name=all"].map(String::from);
        let output = self.netsh(&args).await?;
        Ok(parse_rule_names(&output))
    }

    pub async fn block_ip(&self, ip: IpAddr) -> Result<(), CommandError> {
        self.add_rule(&FirewallRule::block_ip(ip)).await
    }

    pub async fn unblock_ip(&self, ip: IpAddr) -> Result<(), CommandError> {
        self.remove_rule(&ip_rule_name(ip)).await
    }

    /// Current profile state. Errors read as a disabled firewall.
    pub async fn status(&self) -> FirewallStatus {
        let args = ["advfirewall", "show", "currentprofile"].map(String::from);
        match self.netsh(&args).await {
            Ok(output) => FirewallStatus::parse(&output),
            Err(err) => FirewallStatus {
                enabled: false,
                raw_output: err.to_string(),
            },
        }
    }

    /// Whether `netsh` can query the firewall, which requires elevation.
    pub async fn has_admin_privileges(&self) -> bool {
        let args = ["advfirewall", "show", "currentprofile"].map(String::from);
        self.netsh(&args).await.is_ok()
    }
}
