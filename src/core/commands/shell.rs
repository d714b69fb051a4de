use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{ExecContext, ExecError};
use crate::core::request::Request;

/// A host program. The request's arguments are appended after the
/// configured ones.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
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

    /// Runs the program to completion. Dropping the returned future kills
    /// the child.
    pub async fn run(&self, ctx: &ExecContext, request: &Request) -> Result<String, ExecError> {
        info!(
            "Running job #{}: {} {:?}",
            ctx.job_id, self.program, request.args
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env);
        cmd.env("CMDBOT_JOB_ID", ctx.job_id.to_string());
        cmd.env("CMDBOT_USER", &request.username);
        cmd.env("CMDBOT_CHANNEL", &request.channel);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::failed(format!("failed to start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::failed("stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::failed("stderr was not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut output = Vec::new();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    ctx.logs.append(&line).await;
                    output.push(line);
                }
                Err(e) => {
                    return Err(ExecError::Failed {
                        message: format!("reading output: {}", e),
                        output: output.join("\n"),
                    });
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::failed(format!("waiting for {}: {}", self.program, e)))?;
        let stderr = stderr_task.await.unwrap_or_default();
        let output = output.join("\n");
        debug!("Job #{} exited with {}", ctx.job_id, status);

        if status.success() {
            Ok(output)
        } else {
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, stderr)
            };
            Err(ExecError::Failed { message, output })
        }
    }
}

/// One output line without its terminator. Bytes that are not UTF-8 are
/// replaced rather than failing the command.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
