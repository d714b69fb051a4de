//! Per-job output capture.
//!
//! Each job gets its own `logs/<job id>` bucket the first time a line is
//! appended. Lines are keyed by the bucket's own sequence; the error message,
//! if any, sits under a fixed key that cannot collide with an 8-byte line key.

use std::ops::ControlFlow;

use serde::Serialize;

use crate::core::store::{Direction, LOGS_BUCKET, Store, Tx, u64_key};
use crate::error::{Error, Result};

const ERROR_KEY: &[u8] = b"error";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobLog {
    pub job_id: u64,
    pub lines: Vec<String>,
    pub error: Option<String>,
}

impl JobLog {
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Clone)]
pub struct LogLedger {
    store: Store,
}

enum Window {
    All,
    Head(usize),
    Tail(usize),
}

impl LogLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Appends one line. Empty lines are dropped without touching the store.
    pub async fn append(&self, job_id: u64, line: &str) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let id = u64_key(job_id);
        self.store
            .write(|tx| {
                let path: [&[u8]; 2] = [LOGS_BUCKET, &id];
                tx.create_bucket_if_missing(&path)?;
                let seq = tx.next_sequence(&path)?;
                tx.put(&path, &u64_key(seq), line.as_bytes())
            })
            .await
    }

    /// Records the job's error message. Only the first message is kept.
    pub async fn set_error(&self, job_id: u64, error: Option<&str>) -> Result<()> {
        let Some(error) = error else {
            return Ok(());
        };
        let id = u64_key(job_id);
        self.store
            .write(|tx| {
                let path: [&[u8]; 2] = [LOGS_BUCKET, &id];
                tx.create_bucket_if_missing(&path)?;
                if tx.get(&path, ERROR_KEY)?.is_none() {
                    tx.put(&path, ERROR_KEY, error.as_bytes())?;
                }
                Ok(())
            })
            .await
    }

    pub async fn get(&self, job_id: u64) -> Result<JobLog> {
        self.read(job_id, Window::All).await
    }

    pub async fn head(&self, job_id: u64, n: usize) -> Result<JobLog> {
        self.read(job_id, Window::Head(n)).await
    }

    pub async fn tail(&self, job_id: u64, n: usize) -> Result<JobLog> {
        self.read(job_id, Window::Tail(n)).await
    }

    async fn read(&self, job_id: u64, window: Window) -> Result<JobLog> {
        let id = u64_key(job_id);
        self.store
            .read(|tx| {
                let path: [&[u8]; 2] = [LOGS_BUCKET, &id];
                if !tx.bucket_exists(&path)? {
                    return Err(Error::LogsNotFound(job_id));
                }
                let lines = match window {
                    Window::All => collect_lines(tx, &path, Direction::Forward, usize::MAX)?,
                    Window::Head(n) => collect_lines(tx, &path, Direction::Forward, n)?,
                    Window::Tail(n) => {
                        let mut lines = collect_lines(tx, &path, Direction::Backward, n)?;
                        lines.reverse();
                        lines
                    }
                };
                let error = tx
                    .get(&path, ERROR_KEY)?
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned());
                Ok(JobLog {
                    job_id,
                    lines,
                    error,
                })
            })
            .await
    }
}

fn collect_lines(
    tx: &Tx<'_>,
    path: &[&[u8]],
    direction: Direction,
    limit: usize,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    if limit == 0 {
        return Ok(lines);
    }
    tx.scan(path, direction, |key, value| {
        // the error slot shares the bucket with the 8-byte line keys
        if key.len() == 8 {
            lines.push(String::from_utf8_lossy(value).into_owned());
        }
        if lines.len() >= limit {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })?;
    Ok(lines)
}
