//! The agent process: registers its shell commands with a server, runs
//! whatever it is sent and reports back over HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{
    AGENT_HEADER, AgentConfiguration, CommandFinish, CommandRequest, ErrorLogEntry, FinishAck,
    LogEntry, RemoteCommandSpec, ServerMessage,
};
use crate::config::AgentConfig;
use crate::core::commands::{CapturingSink, ExecContext, LogSink, Registry};
use crate::error::{Error, Result};

const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ships a job's output lines to the server as they are produced.
struct RemoteLogSink {
    http: reqwest::Client,
    base_url: String,
    agent_id: String,
    job_id: u64,
}

#[async_trait]
impl LogSink for RemoteLogSink {
    async fn append(&self, line: &str) {
        let entry = LogEntry {
            job_id: self.job_id,
            line: line.to_string(),
        };
        let res = self
            .http
            .post(format!("{}/agent/logs", self.base_url))
            .header(AGENT_HEADER, &self.agent_id)
            .json(&entry)
            .send()
            .await;
        if let Err(e) = res.and_then(|r| r.error_for_status()) {
            warn!("Failed to ship log line for job #{}: {}", self.job_id, e);
        }
    }

    async fn set_error(&self, error: &str) {
        let entry = ErrorLogEntry {
            job_id: self.job_id,
            error: error.to_string(),
        };
        let res = self
            .http
            .post(format!("{}/agent/logs/error", self.base_url))
            .header(AGENT_HEADER, &self.agent_id)
            .json(&entry)
            .send()
            .await;
        if let Err(e) = res.and_then(|r| r.error_for_status()) {
            warn!("Failed to ship error for job #{}: {}", self.job_id, e);
        }
    }
}

struct Session {
    http: reqwest::Client,
    base_url: String,
    agent_id: String,
    registry: Registry,
}

impl Session {
    async fn execute(&self, request: CommandRequest, cancel: CancellationToken) {
        let job_id = request.job_id;
        let req = request.to_request();
        info!("Running job #{} [{}]", job_id, req.command_line());

        let sink = Arc::new(RemoteLogSink {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            agent_id: self.agent_id.clone(),
            job_id,
        });

        let (content, error) = match self.registry.local(&req.command) {
            None => (String::new(), format!("agent has no command \"{}\"", req.command)),
            Some(command) => {
                let capture = Arc::new(CapturingSink::new(sink.clone()));
                let ctx = ExecContext {
                    job_id,
                    logs: capture.clone(),
                    services: None,
                };
                match command.run_bounded(&ctx, &req, &cancel).await {
                    Ok(content) => (content, String::new()),
                    Err(e) => {
                        let content = match e.output() {
                            Some(output) => output.to_string(),
                            None => capture.captured(),
                        };
                        (content, e.to_string())
                    }
                }
            }
        };
        if !error.is_empty() {
            sink.set_error(&error).await;
        }

        let finish = CommandFinish {
            agent_id: self.agent_id.clone(),
            job_id,
            content,
            error,
        };
        self.post_finish(&finish).await;
    }

    async fn post_finish(&self, finish: &CommandFinish) {
        let res = self
            .http
            .post(format!("{}/agent/finish", self.base_url))
            .header(AGENT_HEADER, &self.agent_id)
            .timeout(FINISH_TIMEOUT)
            .json(finish)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match res {
            Ok(resp) => match resp.json::<FinishAck>().await {
                Ok(ack) if ack.accepted => debug!("Job #{} finish accepted", finish.job_id),
                Ok(_) => warn!("Server no longer waits for job #{}", finish.job_id),
                Err(e) => warn!("Bad finish response for job #{}: {}", finish.job_id, e),
            },
            Err(e) => warn!("Failed to report job #{}: {}", finish.job_id, e),
        }
    }
}

pub struct Agent {
    base_url: String,
    token: Option<String>,
    labels: BTreeMap<String, String>,
    registry: Registry,
    http: reqwest::Client,
}

impl Agent {
    pub fn new(config: &AgentConfig, registry: Registry) -> Self {
        Self {
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            labels: config.labels.clone(),
            registry,
            http: reqwest::Client::new(),
        }
    }

    pub fn configuration(&self) -> AgentConfiguration {
        AgentConfiguration {
            agent_id: String::new(),
            token: self.token.clone(),
            labels: self.labels.clone(),
            commands: self
                .registry
                .shell_commands()
                .iter()
                .map(|(options, _)| RemoteCommandSpec::from_options(options))
                .collect(),
        }
    }

    fn stream_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/agent/stream", ws_base)
    }

    /// Registers and serves commands until the stream ends or `shutdown`
    /// fires. In-flight commands are cancelled and awaited before returning.
    /// Always returns an error: the connection is gone either way.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let url = self.stream_url();
        info!("Connecting to {}", url);
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::TransportFailure(format!("connect {}: {}", url, e)))?;

        let hello = serde_json::to_string(&self.configuration())?;
        ws.send(Message::Text(hello))
            .await
            .map_err(|e| Error::TransportFailure(e.to_string()))?;

        let agent_id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Registered { agent_id } => break agent_id,
                    ServerMessage::Rejected { reason } => return Err(Error::Unauthorized(reason)),
                    ServerMessage::Command(req) => {
                        warn!("Ignoring job #{} sent before registration", req.job_id)
                    }
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::TransportFailure(e.to_string())),
                None => {
                    return Err(Error::TransportFailure(
                        "server closed the stream during registration".into(),
                    ));
                }
            }
        };
        info!("Registered as agent {}", agent_id);

        let session = Arc::new(Session {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            agent_id,
            registry: self.registry.clone(),
        });
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break "shutdown requested".to_string(),
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Command(request)) => {
                            let session = session.clone();
                            let cancel = root.child_token();
                            tracker.spawn(async move { session.execute(request, cancel).await });
                        }
                        Ok(other) => debug!("Ignoring server frame {:?}", other),
                        Err(e) => warn!("Malformed server frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break "server closed the stream".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                },
            }
        };

        info!("Agent stopping: {}", reason);
        root.cancel();
        tracker.close();
        tracker.wait().await;
        let _ = ws.close(None).await;
        Err(Error::TransportFailure(reason))
    }
}
