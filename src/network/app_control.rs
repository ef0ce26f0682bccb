//! Per-application network rules.
//!
//! Rules are keyed by lowercased process name and persisted in the
//! `app_control.rules` section of the settings. With
//! `windows.firewall_integration` on, enabled block rules are enforced by an
//! outbound firewall rule on the program's executable.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use super::monitor::Connection;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::events::{EventLog, EventType};
use crate::platform::firewall::{FirewallRule, program_rule_name};
use crate::platform::{CommandRunner, Firewall, SystemRunner};

/// Reason reported for processes blocked by a rule.
pub const BLOCK_REASON: &str = "Blocked by app control rule";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Block,
}

impl RuleAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Network rule for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub process_name: String,
    #[serde(default)]
    pub action: RuleAction,
    /// Recorded for display; traffic is not shaped.
    #[serde(default)]
    pub bandwidth_limit_kbps: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: String,
}

impl AppRule {
    pub fn blocks(&self) -> bool {
        self.enabled && self.action == RuleAction::Block
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppControlStats {
    pub total_rules: usize,
    pub active_rules: usize,
    pub blocked_apps: usize,
    pub bandwidth_limited: usize,
}

/// A process with open connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub connections_count: usize,
    pub rule: Option<AppRule>,
    pub blocked: bool,
}

/// Manages per-application rules.
pub struct AppControl<R: CommandRunner = SystemRunner> {
    config: Arc<ConfigStore>,
    events: Arc<EventLog>,
    firewall: Firewall<R>,
    rules: RwLock<BTreeMap<String, AppRule>>,
}

impl AppControl<SystemRunner> {
    pub fn new(config: Arc<ConfigStore>, events: Arc<EventLog>) -> Self {
        let firewall = Firewall::new(events.clone());
        Self::with_firewall(config, events, firewall)
    }
}

impl<R: CommandRunner> AppControl<R> {
    /// Load the rules saved in the settings.
    pub fn with_firewall(config: Arc<ConfigStore>, events: Arc<EventLog>, firewall: Firewall<R>) -> Self {
        let rules = config.read(|settings| {
            settings
                .app_control
                .rules
                .iter()
                .map(|rule| {
                    let mut rule = rule.clone();
                    rule.process_name = rule.process_name.to_lowercase();
                    (rule.process_name.clone(), rule)
                })
                .collect()
        });
        Self {
            config,
            events,
            firewall,
            rules: RwLock::new(rules),
        }
    }

    fn save(&self) -> Result<()> {
        let rules: Vec<AppRule> = self.rules.read().values().cloned().collect();
        self.config.update(|settings| settings.app_control.rules = rules)
    }

    /// Put back the rule a failed save replaced.
    fn restore(&self, process_name: &str, previous: Option<AppRule>) {
        let mut rules = self.rules.write();
        match previous {
            Some(rule) => rules.insert(process_name.to_string(), rule),
            None => rules.remove(process_name),
        };
    }

    fn firewall_enabled(&self) -> bool {
        self.config
            .read(|settings| settings.windows.firewall_integration)
    }

    /// Add a rule, replacing any rule for the same process.
    pub async fn add_rule(
        &self,
        process_name: &str,
        action: RuleAction,
        bandwidth_limit_kbps: Option<u32>,
    ) -> Result<AppRule> {
        let rule = AppRule {
            process_name: process_name.trim().to_lowercase(),
            action,
            bandwidth_limit_kbps,
            enabled: true,
            created_at: Local::now().to_rfc3339(),
        };

        let previous = self
            .rules
            .write()
            .insert(rule.process_name.clone(), rule.clone());
        if let Err(err) = self.save() {
            self.restore(&rule.process_name, previous);
            self.events.log_with(
                EventType::ErrorOccurred,
                format!("Error adding app rule: {err}"),
                json!({ "process": rule.process_name }),
            );
            return Err(err);
        }

        self.events.log_with(
            EventType::RuleAdded,
            format!("Added app control rule: {} -> {}", rule.process_name, action.as_str()),
            json!({ "process": rule.process_name, "action": action.as_str() }),
        );

        if rule.blocks() {
            self.enforce(&rule.process_name).await;
        } else if previous.is_some_and(|p| p.blocks()) {
            self.release(&rule.process_name).await;
        }
        Ok(rule)
    }

    /// Remove the rule for `process_name`. Returns whether one existed.
    pub async fn remove_rule(&self, process_name: &str) -> Result<bool> {
        let name = process_name.to_lowercase();
        let Some(removed) = self.rules.write().remove(&name) else {
            return Ok(false);
        };
        if let Err(err) = self.save() {
            self.restore(&name, Some(removed));
            return Err(err);
        }

        self.events.log_with(
            EventType::RuleRemoved,
            format!("Removed app control rule: {name}"),
            json!({ "process": name }),
        );
        if removed.blocks() {
            self.release(&name).await;
        }
        Ok(true)
    }

    /// Enable or disable a rule. Returns whether the rule exists.
    pub async fn toggle_rule(&self, process_name: &str, enabled: bool) -> Result<bool> {
        let name = process_name.to_lowercase();
        let toggled = {
            let mut rules = self.rules.write();
            match rules.get_mut(&name) {
                Some(rule) => {
                    let previous = rule.clone();
                    rule.enabled = enabled;
                    Some((previous, rule.blocks()))
                }
                None => None,
            }
        };
        let Some((previous, blocking)) = toggled else {
            return Ok(false);
        };
        let was_blocking = previous.blocks();
        if let Err(err) = self.save() {
            self.restore(&name, Some(previous));
            return Err(err);
        }

        match (was_blocking, blocking) {
            (false, true) => self.enforce(&name).await,
            (true, false) => self.release(&name).await,
            _ => {}
        }
        Ok(true)
    }

    pub fn rule(&self, process_name: &str) -> Option<AppRule> {
        self.rules.read().get(&process_name.to_lowercase()).cloned()
    }

    pub fn rules(&self) -> Vec<AppRule> {
        self.rules.read().values().cloned().collect()
    }

    /// The block reason when an enabled block rule covers `process_name`.
    pub fn should_block(&self, process_name: &str) -> Option<&'static str> {
        self.rules
            .read()
            .get(&process_name.to_lowercase())
            .filter(|rule| rule.blocks())
            .map(|_| BLOCK_REASON)
    }

    pub fn statistics(&self) -> AppControlStats {
        let rules = self.rules.read();
        AppControlStats {
            total_rules: rules.len(),
            active_rules: rules.values().filter(|r| r.enabled).count(),
            blocked_apps: rules.values().filter(|r| r.blocks()).count(),
            bandwidth_limited: rules
                .values()
                .filter(|r| r.bandwidth_limit_kbps.is_some())
                .count(),
        }
    }

    /// Processes owning at least one of `connections`, with their rule.
    pub fn running_processes(&self, connections: &[Connection]) -> Vec<ProcessInfo> {
        let mut by_pid: HashMap<u32, (String, usize)> = HashMap::new();
        for connection in connections {
            let entry = by_pid
                .entry(connection.pid)
                .or_insert_with(|| (connection.process.clone(), 0));
            entry.1 += 1;
        }

        let mut processes: Vec<ProcessInfo> = by_pid
            .into_iter()
            .map(|(pid, (name, connections_count))| {
                let rule = self.rule(&name);
                let blocked = rule.as_ref().is_some_and(AppRule::blocks);
                ProcessInfo {
                    pid,
                    name,
                    connections_count,
                    rule,
                    blocked,
                }
            })
            .collect();
        processes.sort_by(|a, b| b.connections_count.cmp(&a.connections_count).then(a.pid.cmp(&b.pid)));
        processes
    }

    async fn enforce(&self, process_name: &str) {
        if !self.firewall_enabled() {
            return;
        }
        let Some(path) = executable_path(process_name) else {
            debug!(process = process_name, "no running process to enforce rule on");
            return;
        };
        let rule = FirewallRule::block_program(process_name, &path);
        if let Err(err) = self.firewall.add_rule(&rule).await {
            warn!(process = process_name, error = %err, "failed to add firewall rule");
        }
    }

    async fn release(&self, process_name: &str) {
        if !self.firewall_enabled() {
            return;
        }
        if let Err(err) = self.firewall.remove_rule(&program_rule_name(process_name)).await {
            warn!(process = process_name, error = %err, "failed to remove firewall rule");
        }
    }
}

/// Executable of the first running process named `process_name`.
fn executable_path(process_name: &str) -> Option<PathBuf> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .values()
        .find(|process| {
            process
                .name()
                .to_string_lossy()
                .eq_ignore_ascii_case(process_name)
        })
        .and_then(|process| process.exe().map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::monitor::tests::connection;
    use crate::platform::tests::MockRunner;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Arc<ConfigStore>,
        events: Arc<EventLog>,
        runner: MockRunner,
        control: AppControl<MockRunner>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let events = Arc::new(EventLog::in_memory());
        let runner = MockRunner::new();
        let firewall = Firewall::with_runner(runner.clone(), events.clone());
        let control = AppControl::with_firewall(config.clone(), events.clone(), firewall);
        Fixture {
            _dir: dir,
            config,
            events,
            runner,
            control,
        }
    }

    #[tokio::test]
    async fn should_add_rule_lowercased_and_persist_it() {
        let f = fixture();

        let rule = f.control.add_rule("Chrome.EXE", RuleAction::Block, Some(512)).await.unwrap();

        assert_eq!(rule.process_name, "chrome.exe");
        assert_eq!(f.control.should_block("CHROME.exe"), Some(BLOCK_REASON));
        let saved = f.config.read(|s| s.app_control.rules.clone());
        assert_eq!(saved, vec![rule]);
        let events = f.events.recent(1, Some(EventType::RuleAdded));
        assert_eq!(events[0].message, "Added app control rule: chrome.exe -> block");
    }

    #[tokio::test]
    async fn should_not_block_allowed_or_disabled_rules() {
        let f = fixture();
        f.control.add_rule("firefox.exe", RuleAction::Allow, None).await.unwrap();
        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();

        assert!(f.control.toggle_rule("game.exe", false).await.unwrap());

        assert_eq!(f.control.should_block("firefox.exe"), None);
        assert_eq!(f.control.should_block("game.exe"), None);
        assert_eq!(f.control.should_block("unknown.exe"), None);
        assert!(!f.control.toggle_rule("unknown.exe", true).await.unwrap());
    }

    #[tokio::test]
    async fn should_remove_rule_and_log_it() {
        let f = fixture();
        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();

        assert!(f.control.remove_rule("GAME.exe").await.unwrap());
        assert!(!f.control.remove_rule("game.exe").await.unwrap());

        assert!(f.control.rules().is_empty());
        assert_eq!(f.events.recent(10, Some(EventType::RuleRemoved)).len(), 1);
    }

    #[tokio::test]
    async fn should_keep_memory_and_settings_in_sync_when_save_fails() {
        let f = fixture();
        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();
        let config_dir = f._dir.path().to_path_buf();
        std::fs::remove_dir_all(&config_dir).unwrap();
        std::fs::write(&config_dir, "").unwrap();

        assert!(f.control.add_rule("chat.exe", RuleAction::Block, None).await.is_err());
        assert!(f.control.add_rule("game.exe", RuleAction::Allow, None).await.is_err());
        assert!(f.control.toggle_rule("game.exe", false).await.is_err());
        assert!(f.control.remove_rule("game.exe").await.is_err());

        let rules = f.control.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, RuleAction::Block);
        assert!(rules[0].enabled);
        assert_eq!(f.config.read(|s| s.app_control.rules.clone()), rules);
        std::fs::remove_file(&config_dir).unwrap();
    }

    #[tokio::test]
    async fn should_reload_saved_rules() {
        let f = fixture();
        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();

        let reloaded = AppControl::new(f.config.clone(), f.events.clone());

        assert_eq!(reloaded.should_block("game.exe"), Some(BLOCK_REASON));
    }

    #[tokio::test]
    async fn should_count_rules() {
        let f = fixture();
        f.control.add_rule("a.exe", RuleAction::Block, Some(100)).await.unwrap();
        f.control.add_rule("b.exe", RuleAction::Allow, None).await.unwrap();
        f.control.add_rule("c.exe", RuleAction::Block, None).await.unwrap();
        f.control.toggle_rule("c.exe", false).await.unwrap();

        assert_eq!(
            f.control.statistics(),
            AppControlStats {
                total_rules: 3,
                active_rules: 2,
                blocked_apps: 1,
                bandwidth_limited: 1,
            }
        );
    }

    #[tokio::test]
    async fn should_group_connections_by_process() {
        let f = fixture();
        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();
        let mut connections = vec![
            connection("1.1.1.1:443", 10),
            connection("1.0.0.1:443", 10),
            connection("8.8.8.8:443", 20),
        ];
        for c in &mut connections {
            c.process = if c.pid == 10 { "Game.exe".into() } else { "svchost.exe".into() };
        }

        let processes = f.control.running_processes(&connections);

        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 10);
        assert_eq!(processes[0].connections_count, 2);
        assert!(processes[0].blocked);
        assert!(!processes[1].blocked);
    }

    #[tokio::test]
    async fn should_leave_firewall_alone_when_integration_is_off() {
        let f = fixture();

        f.control.add_rule("game.exe", RuleAction::Block, None).await.unwrap();
        f.control.remove_rule("game.exe").await.unwrap();

        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn should_remove_firewall_rule_when_integration_is_on() {
        let f = fixture();
        f.config
            .update(|s| s.windows.firewall_integration = true)
            .unwrap();
        f.runner.respond(
            "netsh advfirewall firewall delete rule name=Defensiq_App_nonexistent-process.exe",
            "Deleted 1 rule(s).",
        );

        f.control
            .add_rule("nonexistent-process.exe", RuleAction::Block, None)
            .await
            .unwrap();
        f.control.remove_rule("nonexistent-process.exe").await.unwrap();

        assert_eq!(
            f.runner.calls(),
            vec!["netsh advfirewall firewall delete rule name=Defensiq_App_nonexistent-process.exe"]
        );
    }
}
