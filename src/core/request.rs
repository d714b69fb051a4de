use serde::{Deserialize, Serialize};

/// A command invocation as delivered by a chat transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
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

impl Request {
    pub fn new(command: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_channel(mut self, channel: impl Into<String>, channel_id: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.channel_id = channel_id.into();
        self
    }

    /// Splits a raw chat line into command and arguments. Returns `None` for
    /// blank input.
    pub fn parse_line(line: &str, username: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        Some(Self::new(command, username).with_args(words))
    }

    /// The full command line, for logs and replies.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Info,
    Success,
    Failure,
    Warning,
}

/// A one-shot message back to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    pub style: Style,
    pub channel_id: String,
}

impl Reply {
    pub fn to(request: &Request, text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
            channel_id: request.channel_id.clone(),
        }
    }
}
