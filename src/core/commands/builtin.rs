use serde::{Deserialize, Serialize};

use super::{Command, CommandOptions, ExecContext, ExecError, Services};
use crate::core::jobs::{Job, JobFilter};
use crate::core::request::Request;

const DEFAULT_JOB_LIMIT: usize = 10;
const DEFAULT_LOG_LINES: usize = 20;

/// Commands answered by the bot itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    Help,
    Version,
    Jobs,
    Logs,
    Kill,
    Stats,
    Agents,
    Alias,
}

impl Builtin {
    pub const ALL: [Builtin; 8] = [
        Builtin::Help,
        Builtin::Version,
        Builtin::Jobs,
        Builtin::Logs,
        Builtin::Kill,
        Builtin::Stats,
        Builtin::Agents,
        Builtin::Alias,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Help => "help",
            Builtin::Version => "version",
            Builtin::Jobs => "jobs",
            Builtin::Logs => "logs",
            Builtin::Kill => "kill",
            Builtin::Stats => "stats",
            Builtin::Agents => "agents",
            Builtin::Alias => "alias",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Builtin::Help => "list available commands",
            Builtin::Version => "show the bot version",
            Builtin::Jobs => "jobs [n] [mine]: show recent jobs",
            Builtin::Logs => "logs <job id> [n]: show the last lines of a job",
            Builtin::Kill => "kill <job id>: stop a running job",
            Builtin::Stats => "show executor counters",
            Builtin::Agents => "list connected agents",
            Builtin::Alias => "alias [name [command...]]: list, show, set or clear your aliases",
        }
    }

    /// The default command entry for this builtin. Builtins are not recorded
    /// as jobs.
    pub fn command(self) -> Command {
        Command::builtin(
            CommandOptions::new(self.name())
                .help(self.describe())
                .record(false),
            self,
        )
    }

    pub fn defaults() -> Vec<Command> {
        Self::ALL.iter().map(|b| b.command()).collect()
    }

    pub async fn run(&self, ctx: &ExecContext, request: &Request) -> Result<String, ExecError> {
        let services = || {
            ctx.services.as_ref().ok_or_else(|| {
                ExecError::failed(format!("{} is only available on the server", self.name()))
            })
        };

        match self {
            Builtin::Version => Ok(format!("cmdbot {}", env!("CARGO_PKG_VERSION"))),
            Builtin::Help => Ok(help(services()?)),
            Builtin::Jobs => jobs(services()?, request).await,
            Builtin::Logs => logs(services()?, request).await,
            Builtin::Kill => kill(services()?, request),
            Builtin::Stats => Ok(stats(services()?)),
            Builtin::Agents => Ok(agents(services()?)),
            Builtin::Alias => alias(services()?, request).await,
        }
    }
}

fn parse_id(request: &Request) -> Result<u64, ExecError> {
    let raw = request
        .args
        .first()
        .ok_or_else(|| ExecError::failed(format!("usage: {} <job id>", request.command)))?;
    raw.trim_start_matches('#')
        .parse()
        .map_err(|_| ExecError::failed(format!("\"{}\" is not a job id", raw)))
}

fn help(services: &Services) -> String {
    services
        .registry
        .commands()
        .iter()
        .map(|opts| {
            if opts.help.is_empty() {
                opts.name.clone()
            } else {
                format!("{} - {}", opts.name, opts.help)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn job_line(job: &Job) -> String {
    format!(
        "#{} {} [{}] by {} at {}",
        job.id,
        job.status,
        job.request.command_line(),
        job.request.username,
        job.start_time.format("%Y-%m-%d %H:%M:%S")
    )
}

async fn jobs(services: &Services, request: &Request) -> Result<String, ExecError> {
    let mut limit = DEFAULT_JOB_LIMIT;
    let mut mine = false;
    for arg in &request.args {
        if arg == "mine" {
            mine = true;
        } else {
            limit = arg
                .parse()
                .map_err(|_| ExecError::failed(format!("\"{}\" is not a number", arg)))?;
        }
    }
    let filter = if mine {
        JobFilter::for_user(limit, request.username.clone())
    } else {
        JobFilter::latest(limit)
    };
    let found = services
        .jobs
        .find(filter)
        .await
        .map_err(|e| ExecError::failed(e.to_string()))?;
    if found.is_empty() {
        return Ok("No jobs yet.".to_string());
    }
    Ok(found.iter().map(job_line).collect::<Vec<_>>().join("\n"))
}

async fn logs(services: &Services, request: &Request) -> Result<String, ExecError> {
    let id = parse_id(request)?;
    let n = match request.args.get(1) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ExecError::failed(format!("\"{}\" is not a number", raw)))?,
        None => DEFAULT_LOG_LINES,
    };
    let log = services
        .logs
        .tail(id, n)
        .await
        .map_err(|e| ExecError::failed(e.to_string()))?;
    let mut out = log.output();
    if let Some(error) = log.error {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("error: {}", error));
    }
    Ok(out)
}

fn kill(services: &Services, request: &Request) -> Result<String, ExecError> {
    let id = parse_id(request)?;
    if services.cancels.cancel(id) {
        Ok(format!("Job #{} killed.", id))
    } else {
        Err(ExecError::failed(format!("Job #{} is not running", id)))
    }
}

fn stats(services: &Services) -> String {
    let s = services.stats.snapshot();
    format!(
        "accepted: {}\nrejected: {}\nrunning: {}\nsucceeded: {}\nfailed: {}\nkilled: {}",
        s.accepted,
        s.rejected,
        services.cancels.len(),
        s.succeeded,
        s.failed,
        s.killed
    )
}

fn agents(services: &Services) -> String {
    let Some(hub) = services.registry.hub() else {
        return "Remote agents are not enabled.".to_string();
    };
    let agents = hub.agents();
    if agents.is_empty() {
        return "No agents connected.".to_string();
    }
    agents
        .iter()
        .map(|a| {
            let mut line = format!("{} [{}]", a.agent_id, a.commands.join(", "));
            if !a.labels.is_empty() {
                let labels: Vec<String> =
                    a.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                line.push_str(&format!(" {}", labels.join(" ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn alias(services: &Services, request: &Request) -> Result<String, ExecError> {
    let aliases = &services.aliases;
    let user = &request.username;
    let fail = |e: crate::error::Error| ExecError::failed(e.to_string());

    match request.args.as_slice() {
        [] => {
            let list = aliases.list(user).await.map_err(fail)?;
            if list.is_empty() {
                return Ok("You have no aliases.".to_string());
            }
            Ok(list
                .iter()
                .map(|(name, line)| format!("{} = {}", name, line))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        [name] => match aliases.get(user, name).await.map_err(fail)? {
            Some(line) => Ok(format!("{} = {}", name, line)),
            None => Err(ExecError::failed(format!("No alias named \"{}\"", name))),
        },
        [name, dash] if dash == "-" => {
            if aliases.remove(user, name).await.map_err(fail)? {
                Ok(format!("Removed alias \"{}\".", name))
            } else {
                Err(ExecError::failed(format!("No alias named \"{}\"", name)))
            }
        }
        [name, rest @ ..] => {
            if services.registry.local(name).is_some() {
                return Err(ExecError::failed(format!(
                    "\"{}\" is already a command",
                    name
                )));
            }
            let line = rest.join(" ");
            aliases.set(user, name, &line).await.map_err(fail)?;
            Ok(format!("{} = {}", name, line))
        }
    }
}
