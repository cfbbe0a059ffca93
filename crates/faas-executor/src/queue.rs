use faas_common::{FaasError, Job, JobId, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Backpressure, QueueConfig};

/// Bounded FIFO between submission and the workers.
///
/// Capacity is tracked by a semaphore: a permit is taken on admission and
/// returned when the job leaves the queue, so admission never blocks on the
/// job list lock.
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    slots: Semaphore,
    available: Notify,
    closed: AtomicBool,
    capacity: usize,
    backpressure: Backpressure,
}

/// Admission granted by [`JobQueue::reserve`]. Dropping it without pushing
/// gives the slot back.
pub struct QueueSlot<'a> {
    queue: &'a JobQueue,
    permit: SemaphorePermit<'a>,
}

impl QueueSlot<'_> {
    /// Append the job. Fails with `ShuttingDown` if the queue was closed
    /// after the slot was reserved; the slot is given back.
    pub async fn push(self, job: Job) -> Result<JobId> {
        let id = job.id;
        {
            let mut jobs = self.queue.jobs.lock().await;
            // Checked under the lock so `drain_pending` cannot miss the job.
            if self.queue.is_closed() {
                return Err(FaasError::ShuttingDown);
            }
            self.permit.forget();
            jobs.push_back(job);
        }
        self.queue.available.notify_one();
        Ok(id)
    }
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(config.capacity)),
            slots: Semaphore::new(config.capacity),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: config.capacity,
            backpressure: config.backpressure,
        }
    }

    /// Claim a slot according to the backpressure policy.
    pub async fn reserve(&self) -> Result<QueueSlot<'_>> {
        if self.is_closed() {
            return Err(FaasError::ShuttingDown);
        }
        let permit = match self.backpressure {
            Backpressure::Reject => self.slots.try_acquire().map_err(|e| match e {
                TryAcquireError::Closed => FaasError::ShuttingDown,
                TryAcquireError::NoPermits => FaasError::QueueFull,
            })?,
            Backpressure::Block { timeout } => {
                match tokio::time::timeout(timeout, self.slots.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(FaasError::ShuttingDown),
                    Err(_) => return Err(FaasError::QueueFull),
                }
            }
        };
        Ok(QueueSlot {
            queue: self,
            permit,
        })
    }

    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        self.reserve().await?.push(job).await
    }

    /// Next job in submission order. Waits until one is available; returns
    /// `None` once `token` is cancelled, or when the queue is closed and empty.
    pub async fn dequeue(&self, token: &CancellationToken) -> Option<Job> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if token.is_cancelled() {
                return None;
            }
            if let Some(job) = self.pop().await {
                return Some(job);
            }
            if self.is_closed() {
                return None;
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    async fn pop(&self) -> Option<Job> {
        let (job, more) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.pop_front()?;
            (job, !jobs.is_empty())
        };
        self.slots.add_permits(1);
        // Pass the wakeup on if more work is waiting.
        if more {
            self.available.notify_one();
        }
        Some(job)
    }

    /// Take a job out before any worker has seen it.
    pub async fn remove(&self, id: &JobId) -> Option<Job> {
        let job = {
            let mut jobs = self.jobs.lock().await;
            let position = jobs.iter().position(|j| &j.id == id)?;
            jobs.remove(position)
        }?;
        self.slots.add_permits(1);
        debug!(job_id = %id, "Job removed from queue");
        Some(job)
    }

    /// Refuse new submissions and wake idle consumers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.available.notify_waiters();
    }

    /// Remove every job still waiting.
    pub async fn drain_pending(&self) -> Vec<Job> {
        let drained: Vec<Job> = self.jobs.lock().await.drain(..).collect();
        self.slots.add_permits(drained.len());
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
