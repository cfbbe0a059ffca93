use dashmap::DashMap;
use faas_common::{FaasError, Job, JobId, JobStore, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_RETENTION: usize = 1024;

/// Live view of the jobs the engine has accepted, plus write-through to the
/// external store on each status transition.
///
/// Non-terminal jobs are always tracked. Only the most recent `retention`
/// terminal snapshots are kept; older ones are only in the store.
pub struct JobTracker {
    jobs: DashMap<JobId, Job>,
    cancellations: DashMap<JobId, CancellationToken>,
    /// Terminal job ids, oldest first.
    finished: Mutex<VecDeque<JobId>>,
    retention: usize,
    store: Arc<dyn JobStore>,
    store_timeout: Duration,
    completion: Notify,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>, store_timeout: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            cancellations: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention: DEFAULT_RETENTION,
            store,
            store_timeout,
            completion: Notify::new(),
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Track a freshly submitted job and persist its `Queued` record.
    pub async fn register(&self, job: &Job) {
        self.jobs.insert(job.id, job.clone());
        self.cancellations.insert(job.id, CancellationToken::new());
        self.persist(job).await;
    }

    /// Apply `mutate` to the tracked job, then persist the new snapshot.
    pub async fn update<F>(&self, id: JobId, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let snapshot = {
            let mut entry = self
                .jobs
                .get_mut(&id)
                .ok_or_else(|| FaasError::NotFound(format!("job {id}")))?;
            mutate(entry.value_mut())?;
            entry.value().clone()
        };

        self.persist(&snapshot).await;
        if snapshot.is_terminal() {
            self.cancellations.remove(&id);
            self.retire(id).await;
            self.completion.notify_waiters();
        }
        Ok(snapshot)
    }

    /// Remember a terminal job and evict the oldest beyond `retention`.
    async fn retire(&self, id: JobId) {
        let mut finished = self.finished.lock().await;
        finished.push_back(id);
        while finished.len() > self.retention {
            if let Some(evicted) = finished.pop_front() {
                self.jobs.remove(&evicted);
                debug!(job_id = %evicted, "Terminal job evicted from tracker");
            }
        }
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    /// Cancellation token of a non-terminal job.
    pub fn cancellation_token(&self, id: &JobId) -> Option<CancellationToken> {
        self.cancellations.get(id).map(|entry| entry.value().clone())
    }

    /// Wait until the job is terminal or `timeout` passes; returns the latest
    /// snapshot either way. `NotFound` once the job has been evicted.
    pub async fn wait_terminal(&self, id: &JobId, timeout: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self
                .get(id)
                .ok_or_else(|| FaasError::NotFound(format!("job {id}")))?;
            if job.is_terminal() {
                return Ok(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(job);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    async fn persist(&self, job: &Job) {
        match tokio::time::timeout(self.store_timeout, self.store.persist(job)).await {
            Ok(Ok(())) => debug!(job_id = %job.id, status = ?job.status, "Job persisted"),
            Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "Failed to persist job"),
            Err(_) => warn!(job_id = %job.id, timeout = ?self.store_timeout, "Job persist timed out"),
        }
    }
}
