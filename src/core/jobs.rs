//! Durable job history.
//!
//! Jobs live in the `jobs` bucket keyed by their big-endian id, so the
//! newest job is always the last key. Records are JSON.

use std::fmt;
use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::request::Request;
use crate::core::store::{Direction, JOBS_BUCKET, Store, key_u64, u64_key};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Successful,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub request: Request,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// The null job stands in for commands that are not recorded. It is
    /// never written to the store.
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

/// Selects jobs for [`JobLedger::find`]. The walk stops as soon as `limit`
/// jobs matched.
pub struct JobFilter {
    limit: usize,
    predicate: Box<dyn Fn(&Job) -> bool + Send + Sync>,
}

impl JobFilter {
    pub fn latest(limit: usize) -> Self {
        Self::matching(limit, |_| true)
    }

    pub fn matching<F>(limit: usize, predicate: F) -> Self
    where
        F: Fn(&Job) -> bool + Send + Sync + 'static,
    {
        Self {
            limit,
            predicate: Box::new(predicate),
        }
    }

    pub fn for_user(limit: usize, username: impl Into<String>) -> Self {
        let username = username.into();
        Self::matching(limit, move |job| job.request.username == username)
    }

    pub fn with_status(limit: usize, status: JobStatus) -> Self {
        Self::matching(limit, move |job| job.status == status)
    }
}

#[derive(Clone)]
pub struct JobLedger {
    store: Store,
}

impl JobLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Allocates the next id and stores a new running job.
    pub async fn create(&self, request: Request) -> Result<Job> {
        let job = self
            .store
            .write(move |tx| {
                tx.create_bucket_if_missing(&[JOBS_BUCKET])?;
                let id = tx.next_sequence(&[JOBS_BUCKET])?;
                let job = Job {
                    id,
                    request,
                    status: JobStatus::Running,
                    start_time: Utc::now(),
                    end_time: None,
                };
                tx.put(&[JOBS_BUCKET], &u64_key(id), &serde_json::to_vec(&job)?)?;
                Ok(job)
            })
            .await?;
        debug!("Created job #{} for [{}]", job.id, job.request.command_line());
        Ok(job)
    }

    pub fn null(&self, request: Request) -> Job {
        Job {
            id: 0,
            request,
            status: JobStatus::Running,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub async fn get(&self, id: u64) -> Result<Job> {
        self.store
            .read(|tx| match tx.get(&[JOBS_BUCKET], &u64_key(id))? {
                Some(raw) => Ok(serde_json::from_slice(&raw)?),
                None => Err(Error::JobNotFound(id)),
            })
            .await
    }

    /// Moves a running job to a terminal status. Fails if the job already
    /// left `Running`; the stored record is left untouched in that case.
    pub async fn finish(&self, id: u64, status: JobStatus) -> Result<Job> {
        self.store
            .write(|tx| {
                let raw = tx
                    .get(&[JOBS_BUCKET], &u64_key(id))?
                    .ok_or(Error::JobNotFound(id))?;
                let mut job: Job = serde_json::from_slice(&raw)?;
                if job.status.is_terminal() || !status.is_terminal() {
                    return Err(Error::InvalidTransition {
                        id,
                        from: job.status,
                        to: status,
                    });
                }
                job.status = status;
                job.end_time = Some(Utc::now());
                tx.put(&[JOBS_BUCKET], &u64_key(id), &serde_json::to_vec(&job)?)?;
                Ok(job)
            })
            .await
    }

    /// Newest-first search. Walks the bucket backward and stops once
    /// `filter.limit` jobs matched.
    pub async fn find(&self, filter: JobFilter) -> Result<Vec<Job>> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }
        self.store
            .read(|tx| {
                let mut found = Vec::new();
                if !tx.bucket_exists(&[JOBS_BUCKET])? {
                    return Ok(found);
                }
                tx.scan(&[JOBS_BUCKET], Direction::Backward, |_, raw| {
                    let job: Job = serde_json::from_slice(raw)?;
                    if (filter.predicate)(&job) {
                        found.push(job);
                    }
                    if found.len() >= filter.limit {
                        Ok(ControlFlow::Break(()))
                    } else {
                        Ok(ControlFlow::Continue(()))
                    }
                })?;
                Ok(found)
            })
            .await
    }

    pub async fn latest(&self, limit: usize) -> Result<Vec<Job>> {
        self.find(JobFilter::latest(limit)).await
    }

    /// Marks every job still `Running` as `Killed`. Run once at startup: a
    /// running job on disk means the previous process died mid-execution.
    pub async fn fail_running_jobs(&self) -> Result<usize> {
        let killed = self
            .store
            .write(|tx| {
                if !tx.bucket_exists(&[JOBS_BUCKET])? {
                    return Ok(0);
                }
                let mut running = Vec::new();
                tx.scan(&[JOBS_BUCKET], Direction::Forward, |key, raw| {
                    let job: Job = serde_json::from_slice(raw)?;
                    if job.status == JobStatus::Running {
                        running.push((key.to_vec(), job));
                    }
                    Ok(ControlFlow::Continue(()))
                })?;

                let now = Utc::now();
                for (key, mut job) in running.iter().cloned() {
                    job.status = JobStatus::Killed;
                    job.end_time = Some(now);
                    tx.put(&[JOBS_BUCKET], &key, &serde_json::to_vec(&job)?)?;
                    debug!(
                        "Recovered job #{} as killed",
                        key_u64(&key).unwrap_or_default()
                    );
                }
                Ok(running.len())
            })
            .await?;
        if killed > 0 {
            info!("Marked {} abandoned running job(s) as killed", killed);
        }
        Ok(killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> JobLedger {
        JobLedger::new(Store::in_memory())
    }

    fn req(cmd: &str) -> Request {
        Request::new(cmd, "alice").in_channel("general", "C1")
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let jobs = ledger();
        let mut last = 0;
        for _ in 0..5 {
            let job = jobs.create(req("echo")).await.unwrap();
            assert!(job.id > last);
            assert_eq!(job.status, JobStatus::Running);
            assert!(job.end_time.is_none());
            last = job.id;
        }
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let jobs = ledger();
        assert!(matches!(
            jobs.get(42).await.unwrap_err(),
            Error::JobNotFound(42)
        ));
        jobs.create(req("echo")).await.unwrap();
        assert!(jobs.get(2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn finish_only_once() {
        let jobs = ledger();
        let job = jobs.create(req("echo")).await.unwrap();
        let done = jobs.finish(job.id, JobStatus::Successful).await.unwrap();
        assert_eq!(done.status, JobStatus::Successful);
        assert!(done.end_time.is_some());

        let err = jobs.finish(job.id, JobStatus::Failed).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::Successful,
                to: JobStatus::Failed,
                ..
            }
        ));
        let stored = jobs.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Successful);
        assert_eq!(stored.end_time, done.end_time);
    }

    #[tokio::test]
    async fn finish_rejects_running_as_end_status() {
        let jobs = ledger();
        let job = jobs.create(req("echo")).await.unwrap();
        assert!(jobs.finish(job.id, JobStatus::Running).await.is_err());
        assert_eq!(jobs.get(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn find_is_newest_first_and_limited() {
        let jobs = ledger();
        assert!(jobs.latest(5).await.unwrap().is_empty());

        for _ in 0..2 {
            jobs.create(req("echo")).await.unwrap();
        }
        let ids: Vec<u64> = jobs.latest(5).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 1]);

        jobs.create(req("echo")).await.unwrap();
        let ids: Vec<u64> = jobs.latest(2).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn find_applies_predicate() {
        let jobs = ledger();
        jobs.create(req("echo")).await.unwrap();
        jobs.create(Request::new("echo", "bob")).await.unwrap();
        jobs.create(req("uptime")).await.unwrap();
        jobs.create(Request::new("date", "bob")).await.unwrap();

        let bobs: Vec<u64> = jobs
            .find(JobFilter::for_user(10, "bob"))
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(bobs, vec![4, 2]);

        let one = jobs.find(JobFilter::for_user(1, "alice")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id, 3);
    }

    #[tokio::test]
    async fn fail_running_jobs_kills_leftovers() {
        let jobs = ledger();
        for _ in 0..3 {
            jobs.create(req("sleep")).await.unwrap();
        }
        let done = jobs.create(req("echo")).await.unwrap();
        jobs.finish(done.id, JobStatus::Successful).await.unwrap();

        assert_eq!(jobs.fail_running_jobs().await.unwrap(), 3);
        let running = jobs
            .find(JobFilter::with_status(100, JobStatus::Running))
            .await
            .unwrap();
        assert!(running.is_empty());
        let killed = jobs
            .find(JobFilter::with_status(100, JobStatus::Killed))
            .await
            .unwrap();
        assert_eq!(killed.len(), 3);
        assert!(killed.iter().all(|j| j.end_time.is_some()));
        assert_eq!(
            jobs.get(done.id).await.unwrap().status,
            JobStatus::Successful
        );
        assert_eq!(jobs.fail_running_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn null_job_is_never_persisted() {
        let jobs = ledger();
        let job = jobs.null(req("help"));
        assert!(job.is_null());
        assert_eq!(job.status, JobStatus::Running);
        assert!(jobs.latest(10).await.unwrap().is_empty());
        assert!(jobs.get(0).await.is_err());
    }
}
