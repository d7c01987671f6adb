//! Rule table access via the `iptables` command.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ApplyError;
use crate::rule::{Rule, RuleSet, TABLES};

pub type Result<T> = std::result::Result<T, ApplyError>;

/// Applies single rules to the host's rule table.
///
/// Implementations decide whether concurrent calls are safe. The watcher
/// bounds concurrency with its worker count and adds no locking of its own.
#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Append a rule to its chain.
    async fn add(&self, rule: &Rule) -> Result<()>;

    /// Delete the first rule in its chain matching the specification.
    async fn delete(&self, rule: &Rule) -> Result<()>;

    /// List rules of one chain, or of every chain in the table when `chain` is `None`.
    async fn list(&self, table: &str, chain: Option<&str>) -> Result<RuleSet>;

    /// List every rule of every known table.
    ///
    /// Tables that cannot be listed (module not loaded, no permission) are skipped.
    async fn list_all(&self) -> Result<RuleSet> {
        let mut all = RuleSet::default();
        for table in TABLES {
            match self.list(table, None).await {
                Ok(set) => all.rules.extend(set),
                Err(e) => warn!(table, "Skipping table in listing: {}", e),
            }
        }
        Ok(all)
    }
}

/// Upper bound for one `iptables` invocation, including the wait for the
/// xtables lock.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`RuleApplier`] backed by the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesApplier {
    binary: String,
    timeout: Duration,
}

impl Default for IptablesApplier {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesApplier {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run iptables and return stdout.
    ///
    /// `-w` waits for the xtables lock for at most the command timeout; a
    /// process still running after that is killed.
    async fn run(&self, args: &[String]) -> Result<String> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!("Running {}", command);

        let lock_wait = self.timeout.as_secs().max(1).to_string();
        let child = Command::new(&self.binary)
            .arg("-w")
            .arg(lock_wait)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| ApplyError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ApplyError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ApplyError::Failed { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn rule_args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            rule.table.clone(),
            op.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.args());
        args
    }
}

#[async_trait]
impl RuleApplier for IptablesApplier {
    async fn add(&self, rule: &Rule) -> Result<()> {
        self.run(&Self::rule_args("-A", rule)).await.map(|_| ())
    }

    async fn delete(&self, rule: &Rule) -> Result<()> {
        self.run(&Self::rule_args("-D", rule)).await.map(|_| ())
    }

    async fn list(&self, table: &str, chain: Option<&str>) -> Result<RuleSet> {
        let mut args = vec!["-t".to_string(), table.to_string(), "-S".to_string()];
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }

        let stdout = self.run(&args).await?;
        parse_listing(table, &stdout)
    }
}

/// Parse `iptables -S` output into rules, skipping policy and chain lines.
pub fn parse_listing(table: &str, output: &str) -> Result<RuleSet> {
    let mut rules = Vec::new();
    for line in output.lines() {
        if let Some(rule) = Rule::from_listing(table, line).map_err(ApplyError::Parse)? {
            rules.push(rule);
        }
    }
    Ok(RuleSet::new(rules))
}
