//! Server-side bookkeeping for connected agents and their in-flight calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AgentConfiguration, CommandFinish, CommandRequest, ErrorLogEntry, LogEntry, RemoteCommandSpec};
use crate::core::commands::ExecError;
use crate::core::logs::LogLedger;
use crate::core::request::Request;
use crate::core::tokens::TokenLedger;
use crate::error::{Error, Result};

const AGENT_QUEUE: usize = 64;

/// Upper bound on the timeout an agent may declare for a command.
pub const MAX_REMOTE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

struct AgentHandle {
    config: AgentConfiguration,
    tx: mpsc::Sender<CommandRequest>,
    order: u64,
    connected_at: DateTime<Utc>,
}

struct PendingCall {
    agent_id: String,
    tx: oneshot::Sender<CommandFinish>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub labels: BTreeMap<String, String>,
    pub commands: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

pub struct AgentHub {
    tokens: TokenLedger,
    logs: LogLedger,
    finish_grace: Duration,
    registrations: AtomicU64,
    agents: Mutex<HashMap<String, AgentHandle>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

/// Removes the pending entry when the dispatching future goes away, whether
/// it finished, timed out or was dropped by a kill.
struct PendingGuard<'a> {
    hub: &'a AgentHub,
    job_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.hub.pending().remove(&self.job_id);
    }
}

impl AgentHub {
    pub fn new(tokens: TokenLedger, logs: LogLedger, finish_grace: Duration) -> Self {
        Self {
            tokens,
            logs,
            finish_grace,
            registrations: AtomicU64::new(0),
            agents: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn agents_lock(&self) -> MutexGuard<'_, HashMap<String, AgentHandle>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts an agent and returns its id and the stream of commands to
    /// forward to it. Registration is open while no tokens exist.
    pub async fn register(
        &self,
        mut config: AgentConfiguration,
    ) -> Result<(String, mpsc::Receiver<CommandRequest>)> {
        if self.tokens.has_any().await? {
            let valid = match config.token.as_deref() {
                Some(token) => self.tokens.validate(token).await?,
                None => false,
            };
            if !valid {
                return Err(Error::Unauthorized("invalid or missing agent token".into()));
            }
        }
        if config.commands.is_empty() {
            return Err(Error::Config("agent offers no commands".into()));
        }

        let agent_id = Uuid::new_v4().to_string();
        config.agent_id = agent_id.clone();
        config.token = None;
        for spec in &mut config.commands {
            spec.timeout_secs = spec.timeout_secs.clamp(1, MAX_REMOTE_TIMEOUT_SECS);
        }
        let names: Vec<&str> = config.commands.iter().map(|c| c.name.as_str()).collect();
        info!("Agent {} registered with commands {:?}", agent_id, names);

        let (tx, rx) = mpsc::channel(AGENT_QUEUE);
        let handle = AgentHandle {
            config,
            tx,
            order: self.registrations.fetch_add(1, Ordering::SeqCst),
            connected_at: Utc::now(),
        };
        self.agents_lock().insert(agent_id.clone(), handle);
        Ok((agent_id, rx))
    }

    /// Drops the agent and fails every call still waiting on it. Returns
    /// the number of calls reaped.
    pub fn unregister(&self, agent_id: &str) -> usize {
        let removed = self.agents_lock().remove(agent_id).is_some();
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, call| call.agent_id != agent_id);
        let reaped = before - pending.len();
        if removed {
            info!("Agent {} disconnected ({} pending call(s) failed)", agent_id, reaped);
        }
        reaped
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents_lock().contains_key(agent_id)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    pub fn finish_grace(&self) -> Duration {
        self.finish_grace
    }

    /// The agent offering `name`, preferring the most recent registration.
    pub fn find_command(&self, name: &str) -> Option<(String, RemoteCommandSpec)> {
        let agents = self.agents_lock();
        agents
            .iter()
            .filter_map(|(id, handle)| {
                handle
                    .config
                    .commands
                    .iter()
                    .find(|c| c.name == name)
                    .map(|spec| (handle.order, id, spec))
            })
            .max_by_key(|(order, _, _)| *order)
            .map(|(_, id, spec)| (id.clone(), spec.clone()))
    }

    /// One spec per command name, as `find_command` would resolve it.
    pub fn catalog(&self) -> Vec<RemoteCommandSpec> {
        let agents = self.agents_lock();
        let mut winners: HashMap<&str, (u64, &RemoteCommandSpec)> = HashMap::new();
        for handle in agents.values() {
            for spec in &handle.config.commands {
                let entry = winners.entry(spec.name.as_str()).or_insert((handle.order, spec));
                if handle.order > entry.0 {
                    *entry = (handle.order, spec);
                }
            }
        }
        let mut out: Vec<RemoteCommandSpec> = winners.into_values().map(|(_, s)| s.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        let agents = self.agents_lock();
        let mut list: Vec<(u64, AgentSummary)> = agents
            .iter()
            .map(|(id, handle)| {
                (
                    handle.order,
                    AgentSummary {
                        agent_id: id.clone(),
                        labels: handle.config.labels.clone(),
                        commands: handle.config.commands.iter().map(|c| c.name.clone()).collect(),
                        connected_at: handle.connected_at,
                    },
                )
            })
            .collect();
        list.sort_by_key(|(order, _)| *order);
        list.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Sends the request to the agent and waits for its Finish, at most
    /// `timeout` plus the configured grace period.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        job_id: u64,
        request: &Request,
        timeout: Duration,
    ) -> std::result::Result<String, ExecError> {
        let tx = self
            .agents_lock()
            .get(agent_id)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| ExecError::Transport(format!("agent {} is not connected", agent_id)))?;

        let (done_tx, done_rx) = oneshot::channel();
        self.pending().insert(
            job_id,
            PendingCall {
                agent_id: agent_id.to_string(),
                tx: done_tx,
            },
        );
        let _guard = PendingGuard { hub: self, job_id };

        tx.send(CommandRequest::new(job_id, request))
            .await
            .map_err(|_| ExecError::Transport(format!("agent {} stream is closed", agent_id)))?;
        debug!("Dispatched job #{} to agent {}", job_id, agent_id);

        let wait = timeout.saturating_add(self.finish_grace);
        match tokio::time::timeout(wait, done_rx).await {
            Err(_) => {
                warn!("Agent {} never finished job #{}", agent_id, job_id);
                Err(ExecError::RemoteTimeout(wait))
            }
            Ok(Err(_)) => Err(ExecError::Transport(format!(
                "agent {} disconnected before finishing job #{}",
                agent_id, job_id
            ))),
            Ok(Ok(finish)) if finish.error.is_empty() => Ok(finish.content),
            Ok(Ok(finish)) => Err(ExecError::Failed {
                message: finish.error,
                output: finish.content,
            }),
        }
    }

    /// Completes a pending call. Late, duplicate and foreign finishes are
    /// ignored.
    pub fn finish(&self, finish: CommandFinish) -> bool {
        let call = {
            let mut pending = self.pending();
            let owner = pending.get(&finish.job_id).map(|call| call.agent_id.clone());
            match owner {
                Some(owner) if owner == finish.agent_id => pending.remove(&finish.job_id),
                Some(owner) => {
                    warn!(
                        "Agent {} sent a finish for job #{} owned by {}",
                        finish.agent_id, finish.job_id, owner
                    );
                    None
                }
                None => None,
            }
        };
        match call {
            Some(call) => call.tx.send(finish).is_ok(),
            None => {
                debug!("Ignoring finish for job #{} with no pending call", finish.job_id);
                false
            }
        }
    }

    pub async fn append_log(&self, entry: LogEntry) -> Result<()> {
        self.logs.append(entry.job_id, &entry.line).await
    }

    pub async fn set_error(&self, entry: ErrorLogEntry) -> Result<()> {
        let error = Some(entry.error.as_str()).filter(|e| !e.is_empty());
        self.logs.set_error(entry.job_id, error).await
    }
}
