//! Local job execution.
//!
//! `submit` resolves and authorizes a request, records the job and pushes it
//! onto a bounded queue. A single dispatch loop drains the queue and spawns
//! each job onto a `TaskTracker`, optionally capped by a semaphore. Running
//! jobs register a cancellation token so `kill` can stop them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::core::aliases::AliasLedger;
use crate::core::commands::{
    CapturingSink, Command, ExecContext, ExecError, GroupResolver, LedgerSink, LogSink, NullSink,
    Registry, Services,
};
use crate::core::jobs::{Job, JobLedger, JobStatus};
use crate::core::logs::LogLedger;
use crate::core::request::{Reply, Request, Style};
use crate::core::store::Store;
use crate::core::templates;
use crate::error::{Error, Result};
use crate::interfaces::ReplySink;

/// Cancellation handles of running jobs, keyed by job id.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl CancelRegistry {
    fn insert(&self, job_id: u64, token: CancellationToken) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job_id, token);
        }
    }

    fn remove(&self, job_id: u64) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&job_id);
        }
    }

    /// Fires the job's token. Returns false if the job is not running.
    pub fn cancel(&self, job_id: u64) -> bool {
        let token = self.inner.lock().ok().and_then(|mut map| map.remove(&job_id));
        match token {
            Some(token) => {
                info!("Killing job #{}", job_id);
                token.cancel();
                true
            }
            None => {
                debug!("Kill requested for job #{} which is not running", job_id);
                false
            }
        }
    }

    pub fn is_running(&self, job_id: u64) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct ExecutorStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    killed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub killed: u64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What `submit` did with a request.
#[derive(Debug)]
pub enum Submission {
    Unknown,
    Unauthorized,
    Queued(Job),
}

struct Task {
    job: Job,
    command: Command,
    request: Request,
}

struct Shared {
    registry: Registry,
    groups: Arc<dyn GroupResolver>,
    jobs: JobLedger,
    logs: LogLedger,
    aliases: AliasLedger,
    replies: Arc<dyn ReplySink>,
    cancels: CancelRegistry,
    stats: Arc<ExecutorStats>,
    root: CancellationToken,
    tracker: TaskTracker,
}

pub struct Executor {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Builds the executor and starts its dispatch loop. Must be called
    /// inside a tokio runtime.
    pub fn new(
        store: Store,
        registry: Registry,
        groups: Arc<dyn GroupResolver>,
        replies: Arc<dyn ReplySink>,
        config: &ExecutorConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry,
            groups,
            jobs: JobLedger::new(store.clone()),
            logs: LogLedger::new(store.clone()),
            aliases: AliasLedger::new(store),
            replies,
            cancels: CancelRegistry::default(),
            stats: Arc::new(ExecutorStats::default()),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let limit = config.max_running.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let dispatcher = tokio::spawn(dispatch(shared.clone(), rx, limit));

        Self {
            shared,
            accepting: AtomicBool::new(true),
            queue: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        }
    }

    pub fn jobs(&self) -> &JobLedger {
        &self.shared.jobs
    }

    pub fn logs(&self) -> &LogLedger {
        &self.shared.logs
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self, job_id: u64) -> bool {
        self.shared.cancels.is_running(job_id)
    }

    /// Resolves, authorizes and enqueues a request. Waits while the queue is
    /// full.
    pub async fn submit(&self, request: Request) -> Result<Submission> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let shared = &self.shared;

        let Some((command, request)) = shared.registry.find(&request).await else {
            debug!("Unknown command [{}] from [{}]", request.command, request.username);
            ExecutorStats::bump(&shared.stats.rejected);
            let text = templates::unknown_command(&request.command);
            shared
                .replies
                .send(Reply::to(&request, text, Style::Warning))
                .await;
            return Ok(Submission::Unknown);
        };

        if !command.options.authorize(&request, shared.groups.as_ref()) {
            warn!(
                "[{}] is not allowed to run [{}] in [{}]",
                request.username, request.command, request.channel
            );
            ExecutorStats::bump(&shared.stats.rejected);
            let text = templates::not_allowed(&request.command);
            shared
                .replies
                .send(Reply::to(&request, text, Style::Failure))
                .await;
            return Ok(Submission::Unauthorized);
        }

        let sender = self
            .queue
            .lock()
            .ok()
            .and_then(|q| q.clone())
            .ok_or(Error::ShuttingDown)?;

        let job = if command.options.record {
            shared.jobs.create(request.clone()).await?
        } else {
            shared.jobs.null(request.clone())
        };

        let task = Task {
            job: job.clone(),
            command,
            request,
        };
        if sender.send(task).await.is_err() {
            if !job.is_null()
                && let Err(e) = shared.jobs.finish(job.id, JobStatus::Killed).await
            {
                warn!("Failed to record job #{} as killed: {}", job.id, e);
            }
            return Err(Error::ShuttingDown);
        }
        ExecutorStats::bump(&shared.stats.accepted);
        Ok(Submission::Queued(job))
    }

    pub fn cancel(&self, job_id: u64) -> bool {
        self.shared.cancels.cancel(job_id)
    }

    /// Stops intake, lets the queue drain and waits for every spawned job.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Executor shutting down, draining queued jobs...");
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        if let Some(handle) = self.dispatcher.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!("Executor dispatch loop ended abnormally: {}", e);
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("Executor stopped");
    }

    /// Fires every running job's token, then drains as `shutdown` does.
    pub async fn abort(&self) {
        self.shared.root.cancel();
        self.shutdown().await;
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::Receiver<Task>, limit: Option<Arc<Semaphore>>) {
    while let Some(task) = rx.recv().await {
        let permit = match &limit {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        let worker = shared.clone();
        shared.tracker.spawn(async move {
            let _permit = permit;
            worker.run(task).await;
        });
    }
    debug!("Executor queue closed");
}

impl Shared {
    fn services(&self) -> Services {
        Services {
            jobs: self.jobs.clone(),
            logs: self.logs.clone(),
            aliases: self.aliases.clone(),
            cancels: self.cancels.clone(),
            stats: self.stats.clone(),
            registry: self.registry.clone(),
        }
    }

    async fn run(&self, task: Task) {
        let Task {
            job,
            command,
            request,
        } = task;
        let options = &command.options;

        if options.handshake {
            let text = options.templates.handshake(&job);
            self.replies
                .send(Reply::to(&request, text, Style::Info))
                .await;
        }

        // The null job shares id 0, so it cannot be addressed by kill.
        let token = self.root.child_token();
        let tracked = !job.is_null();
        if tracked {
            self.cancels.insert(job.id, token.clone());
        }

        let sink: Arc<dyn LogSink> = if tracked {
            Arc::new(LedgerSink::new(self.logs.clone(), job.id))
        } else {
            Arc::new(NullSink)
        };
        let capture = Arc::new(CapturingSink::new(sink));
        let ctx = ExecContext {
            job_id: job.id,
            logs: capture.clone(),
            services: Some(self.services()),
        };

        let result = command.run_bounded(&ctx, &request, &token).await;
        if tracked {
            self.cancels.remove(job.id);
        }

        let (status, reply) = match result {
            Ok(output) => {
                ExecutorStats::bump(&self.stats.succeeded);
                info!("Job #{} [{}] succeeded", job.id, request.command_line());
                let text = options.templates.success(&job, &output);
                (JobStatus::Successful, Reply::to(&request, text, Style::Success))
            }
            Err(err) => {
                let status = match err {
                    ExecError::Canceled => {
                        ExecutorStats::bump(&self.stats.killed);
                        JobStatus::Killed
                    }
                    _ => {
                        ExecutorStats::bump(&self.stats.failed);
                        JobStatus::Failed
                    }
                };
                warn!("Job #{} [{}] {}: {}", job.id, request.command_line(), status, err);
                let message = err.to_string();
                // remote lines bypass the capture and land in the ledger
                let output = match err.output() {
                    Some(output) => output.to_string(),
                    None if tracked && command.is_remote() => self
                        .logs
                        .get(job.id)
                        .await
                        .map(|log| log.output())
                        .unwrap_or_default(),
                    None => capture.captured(),
                };
                capture.set_error(&message).await;
                let text = options.templates.failure(&job, &output, &message);
                (status, Reply::to(&request, text, Style::Failure))
            }
        };

        if tracked && let Err(e) = self.jobs.finish(job.id, status).await {
            warn!("Failed to record outcome of job #{}: {}", job.id, e);
        }
        self.replies.send(reply).await;
    }
}
