//! Running commands on remote agents.
//!
//! An agent opens a websocket to the server, declares the commands it can
//! run and then receives `CommandRequest` frames. Output lines and the final
//! result come back as plain JSON POSTs, identified by the agent id the
//! server assigned at registration.

pub mod agent;
pub mod hub;
pub mod server;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::commands::{AuthStrategy, CommandOptions};
use crate::core::request::Request;
use crate::core::templates::Templates;

/// Names the calling agent on every unary endpoint.
pub const AGENT_HEADER: &str = "x-cmdbot-agent";

/// A command as an agent advertises it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommandSpec {
    pub name: String,
    #[serde(default)]
    pub help: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthStrategy,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub handshake: bool,
    #[serde(default)]
    pub templates: Templates,
}

impl RemoteCommandSpec {
    pub fn from_options(options: &CommandOptions) -> Self {
        Self {
            name: options.name.clone(),
            help: options.help.clone(),
            timeout_secs: options.timeout.as_secs().max(1),
            auth: options.auth,
            allowed_groups: options.allowed_groups.clone(),
            allowed_channels: options.allowed_channels.clone(),
            handshake: options.handshake,
            templates: options.templates.clone(),
        }
    }

    /// Remote commands are always recorded: the pending call is keyed by
    /// job id.
    pub fn to_options(&self) -> CommandOptions {
        CommandOptions {
            name: self.name.clone(),
            help: self.help.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            auth: self.auth,
            allowed_groups: self.allowed_groups.clone(),
            allowed_channels: self.allowed_channels.clone(),
            handshake: self.handshake,
            record: true,
            templates: self.templates.clone(),
        }
    }
}

/// First frame an agent sends. The server fills in `agent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfiguration {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub commands: Vec<RemoteCommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub job_id: u64,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub username: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub is_im: bool,
}

impl CommandRequest {
    pub fn new(job_id: u64, request: &Request) -> Self {
        Self {
            job_id,
            command: request.command.clone(),
            args: request.args.clone(),
            username: request.username.clone(),
            channel: request.channel.clone(),
            channel_id: request.channel_id.clone(),
            is_im: request.is_im,
        }
    }

    pub fn to_request(&self) -> Request {
        Request {
            command: self.command.clone(),
            args: self.args.clone(),
            username: self.username.clone(),
            channel: self.channel.clone(),
            channel_id: self.channel_id.clone(),
            is_im: self.is_im,
        }
    }
}

/// Completion of a dispatched command. A non-empty `error` means failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFinish {
    pub agent_id: String,
    pub job_id: u64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: u64,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub job_id: u64,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishAck {
    pub accepted: bool,
}

/// Frames the server sends down the agent stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { agent_id: String },
    Rejected { reason: String },
    Command(CommandRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_are_tagged() {
        let msg = ServerMessage::Command(CommandRequest::new(
            7,
            &Request::new("echo", "alice").with_args(["hi"]),
        ));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["job_id"], 7);

        let parsed: ServerMessage =
            serde_json::from_str(r#"{"type":"registered","agent_id":"a1"}"#).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Registered {
                agent_id: "a1".into()
            }
        );
    }

    #[test]
    fn spec_options_keep_settings_and_force_recording() {
        let opts = CommandOptions::new("deploy")
            .help("ship it")
            .timeout(Duration::from_secs(60))
            .groups(["ops"])
            .record(false);
        let spec = RemoteCommandSpec::from_options(&opts);
        assert_eq!(spec.timeout_secs, 60);
        let back = spec.to_options();
        assert_eq!(back.auth, AuthStrategy::Groups);
        assert_eq!(back.allowed_groups, vec!["ops"]);
        assert!(back.record);
    }
}
