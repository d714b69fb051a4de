//! Command resolution and the execution contract shared by local, builtin
//! and remote commands.

mod builtin;
mod shell;

pub use builtin::Builtin;
pub use shell::ShellCommand;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::aliases::AliasLedger;
use crate::core::executor::{CancelRegistry, ExecutorStats};
use crate::core::jobs::JobLedger;
use crate::core::logs::LogLedger;
use crate::core::request::Request;
use crate::core::templates::Templates;
use crate::remote::hub::AgentHub;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{message}")]
    Failed { message: String, output: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("canceled")]
    Canceled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no completion from agent within {0:?}")]
    RemoteTimeout(Duration),
}

impl ExecError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecError::Failed {
            message: message.into(),
            output: String::new(),
        }
    }

    /// Output produced before the failure, when the command reported any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::Failed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

/// Where a running command sends its output, one line at a time.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, line: &str);
    async fn set_error(&self, error: &str);
}

/// Discards everything. Used for unrecorded jobs.
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn append(&self, _line: &str) {}
    async fn set_error(&self, _error: &str) {}
}

/// Writes into the Log Ledger under one job id.
pub struct LedgerSink {
    logs: LogLedger,
    job_id: u64,
}

impl LedgerSink {
    pub fn new(logs: LogLedger, job_id: u64) -> Self {
        Self { logs, job_id }
    }
}

#[async_trait]
impl LogSink for LedgerSink {
    async fn append(&self, line: &str) {
        if let Err(e) = self.logs.append(self.job_id, line).await {
            warn!("Failed to append log line for job #{}: {}", self.job_id, e);
        }
    }

    async fn set_error(&self, error: &str) {
        if let Err(e) = self.logs.set_error(self.job_id, Some(error)).await {
            warn!("Failed to store error for job #{}: {}", self.job_id, e);
        }
    }
}

/// Forwards to another sink and keeps a copy of every line, so partial
/// output survives a timeout or a kill.
pub struct CapturingSink {
    inner: Arc<dyn LogSink>,
    lines: Mutex<Vec<String>>,
}

impl CapturingSink {
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self {
            inner,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn captured(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for CapturingSink {
    async fn append(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
        self.inner.append(line).await;
    }

    async fn set_error(&self, error: &str) {
        self.inner.set_error(error).await;
    }
}

/// Handles the server-side builtins need. Absent on agents.
#[derive(Clone)]
pub struct Services {
    pub jobs: JobLedger,
    pub logs: LogLedger,
    pub aliases: AliasLedger,
    pub cancels: CancelRegistry,
    pub stats: Arc<ExecutorStats>,
    pub registry: Registry,
}

#[derive(Clone)]
pub struct ExecContext {
    pub job_id: u64,
    pub logs: Arc<dyn LogSink>,
    pub services: Option<Services>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    #[default]
    Open,
    Groups,
}

/// Looks up which groups a user belongs to.
pub trait GroupResolver: Send + Sync {
    fn groups_of(&self, username: &str) -> Vec<String>;
}

/// Group membership from configuration: group name to member list.
#[derive(Debug, Clone, Default)]
pub struct StaticGroups {
    groups: HashMap<String, Vec<String>>,
}

impl StaticGroups {
    pub fn new(groups: HashMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

impl GroupResolver for StaticGroups {
    fn groups_of(&self, username: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == username))
            .map(|(group, _)| group.clone())
            .collect();
        found.sort();
        found
    }
}

/// Settings every command carries regardless of how it runs.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub name: String,
    pub help: String,
    pub timeout: Duration,
    pub auth: AuthStrategy,
    pub allowed_groups: Vec<String>,
    pub allowed_channels: Vec<String>,
    pub handshake: bool,
    pub record: bool,
    pub templates: Templates,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            help: String::new(),
            timeout: DEFAULT_TIMEOUT,
            auth: AuthStrategy::Open,
            allowed_groups: Vec::new(),
            allowed_channels: Vec::new(),
            handshake: false,
            record: true,
            templates: Templates::default(),
        }
    }
}

impl CommandOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Restricts the command to members of `groups`.
    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth = AuthStrategy::Groups;
        self.allowed_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn templates(mut self, templates: Templates) -> Self {
        self.templates = templates;
        self
    }

    pub fn authorize(&self, request: &Request, groups: &dyn GroupResolver) -> bool {
        if !self.allowed_channels.is_empty()
            && !self.allowed_channels.iter().any(|c| c == &request.channel)
        {
            return false;
        }
        match self.auth {
            AuthStrategy::Open => true,
            AuthStrategy::Groups => {
                let member_of = groups.groups_of(&request.username);
                self.allowed_groups
                    .iter()
                    .any(|allowed| member_of.iter().any(|g| g == allowed))
            }
        }
    }
}

#[derive(Clone)]
pub enum CommandKind {
    Shell(ShellCommand),
    Builtin(Builtin),
    Remote {
        agent_id: String,
        hub: Arc<AgentHub>,
    },
}

#[derive(Clone)]
pub struct Command {
    pub options: CommandOptions,
    pub kind: CommandKind,
}

impl Command {
    pub fn shell(options: CommandOptions, shell: ShellCommand) -> Self {
        Self {
            options,
            kind: CommandKind::Shell(shell),
        }
    }

    pub fn builtin(options: CommandOptions, builtin: Builtin) -> Self {
        Self {
            options,
            kind: CommandKind::Builtin(builtin),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, CommandKind::Remote { .. })
    }

    pub async fn execute(&self, ctx: &ExecContext, request: &Request) -> Result<String, ExecError> {
        match &self.kind {
            CommandKind::Shell(shell) => shell.run(ctx, request).await,
            CommandKind::Builtin(builtin) => builtin.run(ctx, request).await,
            CommandKind::Remote { agent_id, hub } => {
                hub.dispatch(agent_id, ctx.job_id, request, self.options.timeout)
                    .await
            }
        }
    }

    /// Executes under the command's timeout and `cancel`. Whichever fires
    /// first drops the execution future, which kills any child process and
    /// releases any pending remote call. Remote dispatch enforces its own,
    /// longer, deadline.
    pub async fn run_bounded(
        &self,
        ctx: &ExecContext,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        let timeout = self.options.timeout;
        let deadline = async {
            if self.is_remote() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(timeout).await;
        };
        tokio::select! {
            res = self.execute(ctx, request) => res,
            _ = cancel.cancelled() => Err(ExecError::Canceled),
            _ = deadline => Err(ExecError::Timeout(timeout)),
        }
    }
}

/// Resolves command names: local commands first, then the caller's
/// aliases, then whatever connected agents offer.
#[derive(Clone, Default)]
pub struct Registry {
    commands: Arc<HashMap<String, Command>>,
    aliases: Option<AliasLedger>,
    hub: Option<Arc<AgentHub>>,
}

impl Registry {
    pub fn new(commands: Vec<Command>) -> Self {
        let commands = commands
            .into_iter()
            .map(|c| (c.options.name.clone(), c))
            .collect();
        Self {
            commands: Arc::new(commands),
            aliases: None,
            hub: None,
        }
    }

    pub fn with_aliases(mut self, aliases: AliasLedger) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn with_hub(mut self, hub: Arc<AgentHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn hub(&self) -> Option<&Arc<AgentHub>> {
        self.hub.as_ref()
    }

    pub fn local(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Returns the command to run together with the request it should run
    /// with, which differs from `request` when an alias was expanded.
    /// Local commands win over the caller's aliases, which win over agents.
    pub async fn find(&self, request: &Request) -> Option<(Command, Request)> {
        if let Some(command) = self.commands.get(&request.command) {
            return Some((command.clone(), request.clone()));
        }
        if let Some(aliases) = &self.aliases {
            match aliases.expand(request).await {
                Ok(Some(expanded)) => {
                    let command = self.resolve(&expanded.command)?;
                    return Some((command, expanded));
                }
                Ok(None) => {}
                Err(e) => warn!("Alias lookup failed for [{}]: {}", request.username, e),
            }
        }
        self.remote(&request.command)
            .map(|command| (command, request.clone()))
    }

    fn resolve(&self, name: &str) -> Option<Command> {
        self.commands
            .get(name)
            .cloned()
            .or_else(|| self.remote(name))
    }

    fn remote(&self, name: &str) -> Option<Command> {
        let hub = self.hub.as_ref()?;
        let (agent_id, spec) = hub.find_command(name)?;
        Some(Command {
            options: spec.to_options(),
            kind: CommandKind::Remote {
                agent_id,
                hub: hub.clone(),
            },
        })
    }

    /// Every resolvable command, local and remote, sorted by name.
    pub fn commands(&self) -> Vec<CommandOptions> {
        let mut out: Vec<CommandOptions> =
            self.commands.values().map(|c| c.options.clone()).collect();
        if let Some(hub) = &self.hub {
            for spec in hub.catalog() {
                if !self.commands.contains_key(&spec.name) {
                    out.push(spec.to_options());
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out.dedup_by(|a, b| a.name == b.name);
        out
    }

    /// Shell commands, which are the only kind an agent can advertise.
    pub fn shell_commands(&self) -> Vec<(CommandOptions, ShellCommand)> {
        let mut out: Vec<(CommandOptions, ShellCommand)> = self
            .commands
            .values()
            .filter_map(|c| match &c.kind {
                CommandKind::Shell(shell) => Some((c.options.clone(), shell.clone())),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Store;

    fn groups() -> StaticGroups {
        let mut map = HashMap::new();
        map.insert("admins".to_string(), vec!["alice".to_string()]);
        StaticGroups::new(map)
    }

    fn echo() -> Command {
        Command::shell(CommandOptions::new("echo"), ShellCommand::new("echo"))
    }

    #[test]
    fn open_commands_allow_everyone() {
        let opts = CommandOptions::new("echo");
        assert!(opts.authorize(&Request::new("echo", "mallory"), &groups()));
    }

    #[test]
    fn group_commands_check_membership() {
        let opts = CommandOptions::new("deploy").groups(["admins"]);
        assert!(opts.authorize(&Request::new("deploy", "alice"), &groups()));
        assert!(!opts.authorize(&Request::new("deploy", "bob"), &groups()));
    }

    #[test]
    fn channel_restrictions_apply() {
        let opts = CommandOptions::new("deploy").channels(["ops"]);
        let in_ops = Request::new("deploy", "bob").in_channel("ops", "C1");
        let elsewhere = Request::new("deploy", "bob").in_channel("random", "C2");
        assert!(opts.authorize(&in_ops, &groups()));
        assert!(!opts.authorize(&elsewhere, &groups()));
    }

    #[tokio::test]
    async fn find_resolves_local_then_alias() {
        let aliases = AliasLedger::new(Store::in_memory());
        aliases.set("alice", "hi", "echo hello").await.unwrap();
        let registry = Registry::new(vec![echo()]).with_aliases(aliases);

        let (cmd, req) = registry
            .find(&Request::new("echo", "alice"))
            .await
            .unwrap();
        assert_eq!(cmd.name(), "echo");
        assert_eq!(req.command, "echo");

        let (cmd, req) = registry.find(&Request::new("hi", "alice")).await.unwrap();
        assert_eq!(cmd.name(), "echo");
        assert_eq!(req.args, vec!["hello"]);

        assert!(registry.find(&Request::new("hi", "bob")).await.is_none());
        assert!(registry.find(&Request::new("nope", "alice")).await.is_none());
    }

    #[tokio::test]
    async fn run_bounded_reports_timeout_and_cancel() {
        let sleep = Command::shell(
            CommandOptions::new("sleep").timeout(Duration::from_millis(100)),
            ShellCommand::new("sleep").with_args(["5"]),
        );
        let ctx = ExecContext {
            job_id: 0,
            logs: Arc::new(NullSink),
            services: None,
        };
        let req = Request::new("sleep", "alice");

        let res = sleep.run_bounded(&ctx, &req, &CancellationToken::new()).await;
        assert!(matches!(res, Err(ExecError::Timeout(_))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = sleep.run_bounded(&ctx, &req, &cancel).await;
        assert!(matches!(res, Err(ExecError::Canceled)));
    }
}
