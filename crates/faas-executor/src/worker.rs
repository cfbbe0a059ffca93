use faas_common::{
    ExecutionResult, FaasError, FailureKind, FailureReason, FunctionSignature, Job, JobStore,
    Result,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::container_pool::{ContainerPool, PooledContainer};
use crate::metrics_collector::{JobOutcome, JobTimings, MetricsCollector};
use crate::queue::JobQueue;
use crate::runtime::{Invocation, RuntimeAdapter};
use crate::tracker::JobTracker;

/// Everything a worker needs, shared by all workers.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<ContainerPool>,
    pub runtime: Arc<RuntimeAdapter>,
    pub tracker: Arc<JobTracker>,
    pub metrics: Arc<MetricsCollector>,
    pub store: Arc<dyn JobStore>,
    pub config: WorkerConfig,
}

/// Fixed set of symmetric workers looping dequeue -> execute -> release.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `config.workers` workers. They stop taking new jobs once `token`
    /// is cancelled; a job already dequeued runs to completion.
    pub fn spawn(ctx: Arc<WorkerContext>, token: CancellationToken) -> Self {
        let handles = (0..ctx.config.workers)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let token = token.clone();
                tokio::spawn(async move { run_worker(worker_id, ctx, token).await })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>, token: CancellationToken) {
    debug!(worker_id, "Worker started");
    while let Some(job) = ctx.queue.dequeue(&token).await {
        process_job(&ctx, job).await;
    }
    debug!(worker_id, "Worker stopped");
}

#[instrument(skip(ctx, job), fields(job_id = %job.id, function_id = %job.function_id))]
async fn process_job(ctx: &WorkerContext, job: Job) {
    let mut timings = JobTimings::dequeued(&job);
    let cancel = ctx
        .tracker
        .cancellation_token(&job.id)
        .unwrap_or_default();

    if let Err(e) = ctx.tracker.update(job.id, |j| j.assign()).await {
        // Already terminal, e.g. cancelled while queued.
        warn!(error = %e, "Skipping job that cannot be assigned");
        return;
    }

    let outcome = match execute(ctx, &job, &cancel, &mut timings).await {
        Ok(result) => {
            info!(duration = ?result.duration, "Job succeeded");
            ctx.tracker
                .update(job.id, |j| j.succeed(result))
                .await
                .map(|job| (job, JobOutcome::Succeeded))
        }
        Err(err) => finish_failed(ctx, &job, err).await,
    };

    match outcome {
        Ok((job, outcome)) => ctx.metrics.record(&job, &timings, outcome).await,
        Err(e) => error!(error = %e, "Failed to record terminal status"),
    }
}

async fn finish_failed(ctx: &WorkerContext, job: &Job, err: FaasError) -> Result<(Job, JobOutcome)> {
    let reason = FailureReason::from(&err);
    match err {
        FaasError::ExecutionTimeout { partial, timeout } => {
            warn!(?timeout, "Job timed out");
            let job = ctx
                .tracker
                .update(job.id, |j| j.time_out(reason, *partial))
                .await?;
            Ok((job, JobOutcome::TimedOut))
        }
        other => {
            let kind = reason.kind;
            match kind.origin() {
                faas_common::FailureOrigin::Function => info!(error = %other, "Function failed"),
                _ => warn!(error = %other, kind = ?kind, "Job failed"),
            }
            let captured: Option<ExecutionResult> = match other {
                FaasError::ExecutionError(result) => Some(*result),
                _ => None,
            };
            let job = ctx
                .tracker
                .update(job.id, |j| j.fail(reason, captured))
                .await?;
            Ok((job, JobOutcome::Failed(kind)))
        }
    }
}

async fn execute(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
    timings: &mut JobTimings,
) -> Result<ExecutionResult> {
    if cancel.is_cancelled() {
        return Err(FaasError::Cancelled);
    }

    let spec = ctx.store.load_function(&job.function_id).await?;
    let kind = ctx.runtime.runtime_for(spec.trust_tier)?;
    let signature = FunctionSignature::derive(&spec, kind);

    let acquire_started = Instant::now();
    let container = acquire_with_retry(ctx, &signature, cancel).await?;
    timings.acquire = acquire_started.elapsed();
    timings.cold_start = container.cold_start;
    timings.pool_hit = Some(container.cold_start.is_none());

    if let Err(e) = ctx.tracker.update(job.id, |j| j.start(kind)).await {
        ctx.pool.release(&container, true).await;
        return Err(e);
    }

    let invocation = Invocation {
        job_id: job.id,
        code: spec.code.clone(),
        input: job.input.clone(),
    };
    let timeout = spec.timeout.unwrap_or(ctx.config.default_timeout);

    let exec_started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = ctx.runtime.exec(&container.handle, &invocation, timeout) => Some(result),
    };
    timings.execution = exec_started.elapsed();

    release_after(ctx, &container, &outcome).await;
    outcome.unwrap_or(Err(FaasError::Cancelled))
}

/// Decide the container's fate from how the execution ended.
async fn release_after(
    ctx: &WorkerContext,
    container: &PooledContainer,
    outcome: &Option<Result<ExecutionResult>>,
) {
    match outcome {
        // Cancelled mid-run: destroying the container stops the execution.
        None => ctx.pool.release(container, false).await,
        Some(Ok(_)) | Some(Err(FaasError::ExecutionError(_))) => {
            ctx.pool.release(container, true).await
        }
        // The adapter already destroyed it.
        Some(Err(FaasError::ExecutionTimeout { .. })) => ctx.pool.discard(container).await,
        Some(Err(FaasError::RuntimeCrash(_))) => {
            ctx.pool.release(container, false).await;
            let kind = container.handle.kind;
            if !ctx.runtime.recheck_health(kind).await {
                error!(runtime = %kind, "Backend unhealthy after crash");
            }
        }
        Some(Err(_)) => ctx.pool.release(container, false).await,
    }
}

/// Acquire with bounded retries for infra-level failures. The job stays
/// `Assigned` while it waits.
async fn acquire_with_retry(
    ctx: &WorkerContext,
    signature: &FunctionSignature,
    cancel: &CancellationToken,
) -> Result<PooledContainer> {
    let mut attempt = 0;
    loop {
        match ctx.pool.acquire_until(signature, cancel).await {
            Ok(container) => return Ok(container),
            Err(e) if e.is_retriable() && attempt < ctx.config.max_acquire_retries => {
                attempt += 1;
                let backoff = with_jitter(ctx.config.backoff_for(attempt));
                warn!(attempt, ?backoff, error = %e, "Acquire failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FaasError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                if e.is_retriable() {
                    error!(attempts = attempt + 1, error = %e, "Acquire retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

fn with_jitter(backoff: Duration) -> Duration {
    let spread = (backoff.as_millis() / 4) as u64;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Reason attached to jobs that never reached a worker.
pub fn cancelled_reason(message: &str) -> FailureReason {
    FailureReason::new(FailureKind::Cancelled, message)
}
