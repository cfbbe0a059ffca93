use faas_common::{FaasError, FailureKind, FunctionSignature, Job, JobId, JobStore, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::container_pool::{ContainerPool, PoolStats};
use crate::metrics_collector::{JobOutcome, JobTimings, MetricsCollector, MetricsSnapshot};
use crate::queue::JobQueue;
use crate::runtime::RuntimeAdapter;
use crate::tracker::JobTracker;
use crate::worker::{cancelled_reason, WorkerContext, WorkerPool};

/// The execution core: queue, pool, workers and metrics behind the two
/// inbound operations `submit` and `get_status`.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    pool: Arc<ContainerPool>,
    runtime: Arc<RuntimeAdapter>,
    tracker: Arc<JobTracker>,
    metrics: Arc<MetricsCollector>,
    store: Arc<dyn JobStore>,
    shutdown: CancellationToken,
    workers: Mutex<Option<WorkerPool>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config` and start the workers and the idle reaper. Must be
    /// called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        runtime: Arc<RuntimeAdapter>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(JobQueue::new(&config.queue));
        let pool = Arc::new(ContainerPool::new(runtime.clone(), config.pool.clone()));
        let tracker = Arc::new(
            JobTracker::new(store.clone(), config.worker.store_timeout)
                .with_retention(config.worker.job_retention),
        );
        let metrics = Arc::new(MetricsCollector::default());
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            pool: pool.clone(),
            runtime: runtime.clone(),
            tracker: tracker.clone(),
            metrics: metrics.clone(),
            store: store.clone(),
            config: config.worker.clone(),
        });
        let workers = WorkerPool::spawn(ctx, shutdown.child_token());
        let reaper = pool.spawn_reaper(shutdown.child_token());

        info!(
            workers = workers.len(),
            queue_capacity = config.queue.capacity,
            runtime = %runtime.select_runtime(),
            "Engine started"
        );

        Ok(Self {
            config,
            queue,
            pool,
            runtime,
            tracker,
            metrics,
            store,
            shutdown,
            workers: Mutex::new(Some(workers)),
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit a job. Fails with `QueueFull` under backpressure and with
    /// `ShuttingDown` after `shutdown`.
    #[instrument(skip(self, input))]
    pub async fn submit(&self, function_id: &str, input: Value) -> Result<JobId> {
        let slot = self.queue.reserve().await?;
        let job = Job::new(function_id, input);
        let id = job.id;
        // Persist Queued before any worker can see the job.
        self.tracker.register(&job).await;
        if let Err(e) = slot.push(job).await {
            // Shutdown closed the queue while the job was being registered.
            let failed = self
                .tracker
                .update(id, |j| j.fail(cancelled_reason("engine shutting down"), None))
                .await;
            if let Err(update) = failed {
                warn!(job_id = %id, error = %update, "Failed to cancel refused job");
            }
            return Err(e);
        }
        debug!(job_id = %id, "Job queued");
        Ok(id)
    }

    /// Read-only snapshot of a job. Finished jobs are forgotten once more
    /// than `worker.job_retention` newer jobs have finished.
    pub fn get_status(&self, id: &JobId) -> Option<Job> {
        self.tracker.get(id)
    }

    /// Wait for a job to reach a terminal status, up to `timeout`.
    pub async fn wait_for(&self, id: &JobId, timeout: Duration) -> Result<Job> {
        self.tracker.wait_terminal(id, timeout).await
    }

    /// Cancel a job. A queued job is removed and failed right away; a job a
    /// worker owns is cancelled best-effort by destroying its container.
    /// Returns `false` when the job was already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &JobId) -> Result<bool> {
        let job = self
            .tracker
            .get(id)
            .ok_or_else(|| FaasError::NotFound(format!("job {id}")))?;
        if job.is_terminal() {
            return Ok(false);
        }

        if let Some(queued) = self.queue.remove(id).await {
            let timings = JobTimings::dequeued(&queued);
            let job = self
                .tracker
                .update(*id, |j| j.fail(cancelled_reason("cancelled while queued"), None))
                .await?;
            self.metrics
                .record(&job, &timings, JobOutcome::Failed(FailureKind::Cancelled))
                .await;
            info!("Queued job cancelled");
            return Ok(true);
        }

        match self.tracker.cancellation_token(id) {
            Some(token) => {
                token.cancel();
                info!("Cancellation requested for running job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pre-create warm containers for a stored function. Returns how many
    /// were created.
    #[instrument(skip(self))]
    pub async fn warm_function(&self, function_id: &str, count: usize) -> Result<usize> {
        let spec = self.store.load_function(function_id).await?;
        let kind = self.runtime.runtime_for(spec.trust_tier)?;
        let signature = FunctionSignature::derive(&spec, kind);

        let durations = self.pool.warm(&signature, count).await?;
        for elapsed in &durations {
            self.metrics.record_warmup(function_id, *elapsed).await;
        }
        Ok(durations.len())
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    pub fn runtime(&self) -> &Arc<RuntimeAdapter> {
        &self.runtime
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Stop admitting work, fail jobs still queued, let in-flight jobs
    /// finish, then destroy every warm container.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.queue.close();
        self.shutdown.cancel();

        for job in self.queue.drain_pending().await {
            let result = self
                .tracker
                .update(job.id, |j| j.fail(cancelled_reason("engine shutting down"), None))
                .await;
            if let Err(e) = result {
                warn!(job_id = %job.id, error = %e, "Failed to cancel pending job");
            }
        }

        if let Some(workers) = self.workers.lock().await.take() {
            workers.join().await;
        }
        if let Some(reaper) = self.reaper.lock().await.take() {
            let _ = reaper.await;
        }
        self.pool.drain().await;
        info!("Engine stopped");
    }
}
