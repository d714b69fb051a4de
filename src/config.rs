//! YAML configuration.
//!
//! ```yaml
//! database: /var/lib/cmdbot/cmdbot.db
//! log_level: info
//! executor:
//!   queue_size: 32
//!   max_running: 4
//! groups:
//!   admins: [alice]
//! commands:
//!   - name: uptime
//!     run: [uptime]
//!   - name: deploy
//!     run: [/opt/deploy.sh]
//!     groups: [admins]
//!     handshake: true
//!     timeout_secs: 900
//! server:
//!   listen: 0.0.0.0:8750
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::core::commands::{Builtin, Command, CommandOptions, DEFAULT_TIMEOUT, ShellCommand};
use crate::core::templates::Templates;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub queue_size: usize,
    pub max_running: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_size: 32,
            max_running: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the agent hub. Remote agents are disabled when unset.
    pub listen: Option<String>,
    pub finish_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            finish_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn finish_grace(&self) -> Duration {
        Duration::from_secs(self.finish_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub token: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8750".to_string(),
            token: None,
            labels: BTreeMap::new(),
        }
    }
}

/// One entry of the command catalog. Exactly one of `run` and `builtin`
/// must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub name: String,
    pub help: String,
    /// Program followed by its fixed arguments.
    pub run: Vec<String>,
    pub builtin: Option<Builtin>,
    pub workdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
    /// Non-empty restricts the command to these groups.
    pub groups: Vec<String>,
    pub channels: Vec<String>,
    pub handshake: bool,
    pub record: Option<bool>,
    pub templates: Templates,
}

impl CommandConfig {
    pub fn to_command(&self) -> Result<Command> {
        let mut options = CommandOptions::new(&self.name)
            .help(&self.help)
            .timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_TIMEOUT),
            )
            .channels(self.channels.iter().cloned())
            .handshake(self.handshake)
            .templates(self.templates.clone());
        if !self.groups.is_empty() {
            options = options.groups(self.groups.iter().cloned());
        }

        match (self.builtin, self.run.split_first()) {
            (Some(builtin), None) => {
                let options = options.record(self.record.unwrap_or(false));
                Ok(Command::builtin(options, builtin))
            }
            (None, Some((program, args))) => {
                let shell = ShellCommand {
                    program: program.clone(),
                    args: args.to_vec(),
                    workdir: self.workdir.clone(),
                    env: self.env.clone(),
                };
                let options = options.record(self.record.unwrap_or(true));
                Ok(Command::shell(options, shell))
            }
            _ => Err(Error::Config(format!(
                "command \"{}\" needs exactly one of `run` or `builtin`",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: PathBuf,
    pub log_level: String,
    pub executor: ExecutorConfig,
    pub groups: HashMap<String, Vec<String>>,
    pub commands: Vec<CommandConfig>,
    pub server: ServerConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("cmdbot.db"),
            log_level: "info".to_string(),
            executor: ExecutorConfig::default(),
            groups: HashMap::new(),
            commands: Vec::new(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.queue_size == 0 {
            return Err(Error::Config("executor.queue_size must be at least 1".into()));
        }
        if self.executor.max_running == Some(0) {
            return Err(Error::Config("executor.max_running must be at least 1".into()));
        }
        self.log_level()?;

        let mut seen = HashSet::new();
        for command in &self.commands {
            if command.name.trim().is_empty() {
                return Err(Error::Config("command without a name".into()));
            }
            if !seen.insert(command.name.as_str()) {
                return Err(Error::Config(format!("duplicate command \"{}\"", command.name)));
            }
            command.to_command()?;
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        self.log_level
            .parse()
            .map_err(|_| Error::Config(format!("unknown log level \"{}\"", self.log_level)))
    }

    /// Builtins plus the configured commands. A configured command replaces
    /// the builtin of the same name.
    pub fn server_commands(&self) -> Result<Vec<Command>> {
        let mut by_name: BTreeMap<String, Command> = Builtin::defaults()
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        for command in &self.commands {
            by_name.insert(command.name.clone(), command.to_command()?);
        }
        Ok(by_name.into_values().collect())
    }

    /// The shell commands an agent offers.
    pub fn agent_commands(&self) -> Result<Vec<Command>> {
        let mut out = Vec::new();
        for command in self.commands.iter().filter(|c| c.builtin.is_none()) {
            out.push(command.to_command()?);
        }
        Ok(out)
    }
}
