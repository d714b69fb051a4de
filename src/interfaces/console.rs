use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ReplySink;
use crate::core::executor::Executor;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::request::{Reply, Request, Style};

pub const CONSOLE_CHANNEL: &str = "console";

fn format_reply(reply: &Reply) -> String {
    match reply.style {
        Style::Info => reply.text.clone(),
        Style::Success => format!("[ok] {}", reply.text),
        Style::Failure => format!("[failed] {}", reply.text),
        Style::Warning => format!("[warn] {}", reply.text),
    }
}

/// Prints replies to stdout.
pub struct ConsoleReplies;

#[async_trait]
impl ReplySink for ConsoleReplies {
    async fn send(&self, reply: Reply) {
        println!("{}", format_reply(&reply));
    }
}

/// Reads commands from stdin, one per line.
pub struct ConsoleInterface {
    executor: Arc<Executor>,
    username: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConsoleInterface {
    pub fn new(executor: Arc<Executor>) -> Self {
        let username = std::env::var("USER").unwrap_or_else(|_| "console".to_string());
        Self {
            executor,
            username,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

/// Feeds each non-blank line to the executor until input ends or `cancel`
/// fires.
pub(crate) async fn read_requests<R>(
    executor: &Executor,
    username: &str,
    reader: R,
    cancel: &CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Console read error: {}", e);
                break;
            }
        };
        let Some(request) = Request::parse_line(&line, username) else {
            continue;
        };
        let request = request.in_channel(CONSOLE_CHANNEL, CONSOLE_CHANNEL);
        if let Err(e) = executor.submit(request).await {
            warn!("Console request rejected: {}", e);
            break;
        }
    }
}

#[async_trait]
impl LifecycleComponent for ConsoleInterface {
    async fn on_start(&mut self) -> Result<()> {
        info!("Console transport reading commands as [{}]", self.username);
        let executor = self.executor.clone();
        let username = self.username.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            read_requests(&executor, &username, stdin, &cancel).await;
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            // stdin reads cannot be interrupted; don't wait on a blocked one
            handle.abort();
        }
        Ok(())
    }
}
