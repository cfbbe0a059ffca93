use async_trait::async_trait;
use faas_common::{
    ExecutionResult, FaasError, FunctionSignature, JobId, Result, ReturnValue, SandboxKind,
    TrustTier,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RuntimeConfig;

pub mod bootstrap;
pub mod docker;
pub mod probe;

pub use docker::DockerBackend;
pub use probe::{probe_platform, PlatformCapability};

/// A live container created by one of the backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub kind: SandboxKind,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: JobId,
    pub code: String,
    pub input: serde_json::Value,
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

/// Bounded stdout/stderr buffers shared between a backend and the adapter,
/// so output written before a timeout is still readable afterwards.
///
/// When a stream exceeds the limit its oldest bytes are dropped; the return
/// marker is always at the tail.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Captured>>,
    limit: usize,
}

impl OutputSink {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Captured::default())),
            limit,
        }
    }

    pub async fn stdout(&self, bytes: &[u8]) {
        let mut captured = self.inner.lock().await;
        let truncated = append_bounded(&mut captured.stdout, bytes, self.limit);
        captured.truncated |= truncated;
    }

    pub async fn stderr(&self, bytes: &[u8]) {
        let mut captured = self.inner.lock().await;
        let truncated = append_bounded(&mut captured.stderr, bytes, self.limit);
        captured.truncated |= truncated;
    }

    pub async fn truncated(&self) -> bool {
        self.inner.lock().await.truncated
    }

    pub async fn snapshot(&self) -> (String, String) {
        let captured = self.inner.lock().await;
        (
            String::from_utf8_lossy(&captured.stdout).into_owned(),
            String::from_utf8_lossy(&captured.stderr).into_owned(),
        )
    }
}

fn append_bounded(buf: &mut Vec<u8>, bytes: &[u8], limit: usize) -> bool {
    buf.extend_from_slice(bytes);
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
        return true;
    }
    false
}

/// One way of running code in an isolated container. The standard and
/// gVisor backends present the same interface.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Create and start an idle container for `signature`.
    async fn create(&self, signature: &FunctionSignature) -> Result<ContainerHandle>;

    /// Run one invocation, streaming output into `sink`. Returns the exit code.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        invocation: &Invocation,
        sink: &OutputSink,
    ) -> Result<i64>;

    /// Force-remove the container. Removing an unknown container succeeds.
    async fn destroy(&self, handle: &ContainerHandle) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

/// Chooses a backend per function and enforces the execution protocol:
/// wall-clock timeout, output capture and return-value extraction.
pub struct RuntimeAdapter {
    capability: PlatformCapability,
    standard: Arc<dyn SandboxBackend>,
    sandboxed: Option<Arc<dyn SandboxBackend>>,
    enforce_sandbox: bool,
    max_output_bytes: usize,
    standard_healthy: AtomicBool,
    sandboxed_healthy: AtomicBool,
}

impl RuntimeAdapter {
    pub fn new(
        capability: PlatformCapability,
        standard: Arc<dyn SandboxBackend>,
        sandboxed: Option<Arc<dyn SandboxBackend>>,
        config: &RuntimeConfig,
    ) -> Self {
        let sandboxed = if capability.sandbox_available {
            sandboxed
        } else {
            if sandboxed.is_some() {
                warn!("Sandboxed backend supplied but platform probe reports it unavailable");
            }
            None
        };

        info!(
            preferred = %capability.preferred_runtime(),
            enforce_sandbox = config.enforce_sandbox,
            "Runtime adapter initialized"
        );

        Self {
            capability,
            standard,
            sandboxed,
            enforce_sandbox: config.enforce_sandbox,
            max_output_bytes: config.max_output_bytes,
            standard_healthy: AtomicBool::new(true),
            sandboxed_healthy: AtomicBool::new(true),
        }
    }

    pub fn capability(&self) -> &PlatformCapability {
        &self.capability
    }

    /// Process-wide runtime choice, fixed at construction.
    pub fn select_runtime(&self) -> SandboxKind {
        if self.sandboxed.is_some() {
            SandboxKind::Sandboxed
        } else {
            SandboxKind::Standard
        }
    }

    /// Backend kind a function of the given trust tier runs on.
    pub fn runtime_for(&self, tier: TrustTier) -> Result<SandboxKind> {
        match tier {
            TrustTier::Trusted => Ok(SandboxKind::Standard),
            TrustTier::Untrusted if self.sandboxed.is_some() => Ok(SandboxKind::Sandboxed),
            TrustTier::Untrusted if self.enforce_sandbox => Err(FaasError::RuntimeUnavailable(
                "untrusted function requires the sandboxed runtime, which is unavailable".into(),
            )),
            TrustTier::Untrusted => {
                warn!("Sandboxed runtime unavailable, running untrusted function on standard runtime");
                Ok(SandboxKind::Standard)
            }
        }
    }

    fn backend(&self, kind: SandboxKind) -> Result<&Arc<dyn SandboxBackend>> {
        match kind {
            SandboxKind::Standard => Ok(&self.standard),
            SandboxKind::Sandboxed => self.sandboxed.as_ref().ok_or_else(|| {
                FaasError::RuntimeUnavailable("sandboxed runtime not available".into())
            }),
        }
    }

    fn health_flag(&self, kind: SandboxKind) -> &AtomicBool {
        match kind {
            SandboxKind::Standard => &self.standard_healthy,
            SandboxKind::Sandboxed => &self.sandboxed_healthy,
        }
    }

    pub fn is_healthy(&self, kind: SandboxKind) -> bool {
        self.health_flag(kind).load(Ordering::Acquire)
    }

    /// Re-run the backend health check and record the result.
    pub async fn recheck_health(&self, kind: SandboxKind) -> bool {
        let healthy = match self.backend(kind) {
            Ok(backend) => match backend.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    error!(runtime = %kind, error = %e, "Backend health check failed");
                    false
                }
            },
            Err(_) => false,
        };
        self.health_flag(kind).store(healthy, Ordering::Release);
        healthy
    }

    pub async fn create(&self, signature: &FunctionSignature) -> Result<ContainerHandle> {
        let kind = signature.sandbox_kind;
        let backend = self.backend(kind)?;
        if !self.is_healthy(kind) && !self.recheck_health(kind).await {
            return Err(FaasError::RuntimeUnavailable(format!(
                "{kind} runtime is unhealthy"
            )));
        }
        backend.create(signature).await
    }

    pub async fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        self.backend(handle.kind)?.destroy(handle).await
    }

    /// Run `invocation` in `handle` under a wall-clock budget.
    ///
    /// Reaching the budget (elapsed >= timeout) destroys the container and
    /// yields `ExecutionTimeout` with the output captured so far. A non-zero
    /// exit yields `ExecutionError`; backend faults surface as-is.
    #[instrument(skip(self, handle, invocation), fields(job_id = %invocation.job_id, container_id = %handle.id, runtime = %handle.kind))]
    pub async fn exec(
        &self,
        handle: &ContainerHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let backend = self.backend(handle.kind)?;
        let sink = OutputSink::new(self.max_output_bytes);

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, backend.exec(handle, invocation, &sink)).await;
        let elapsed = started.elapsed();

        let (stdout, stderr) = sink.snapshot().await;
        if sink.truncated().await {
            debug!(limit = self.max_output_bytes, "Captured output truncated");
        }

        let exit_code = match outcome {
            Ok(Ok(code)) if elapsed < timeout => code,
            Ok(Err(e)) if elapsed < timeout => {
                error!(error = %e, "Backend fault during execution");
                return Err(e);
            }
            _ => {
                warn!(?elapsed, ?timeout, "Execution timed out, destroying container");
                if let Err(e) = backend.destroy(handle).await {
                    error!(error = %e, "Failed to destroy timed-out container");
                }
                let (stdout, _) = bootstrap::split_return(&stdout);
                return Err(FaasError::ExecutionTimeout {
                    timeout,
                    partial: Box::new(ExecutionResult {
                        stdout,
                        stderr,
                        return_value: ReturnValue::Null,
                        exit_code: None,
                        duration: elapsed,
                        sandbox_kind: handle.kind,
                    }),
                });
            }
        };

        let (stdout, raw_return) = bootstrap::split_return(&stdout);
        let result = ExecutionResult {
            stdout,
            stderr,
            return_value: raw_return
                .map(|raw| ReturnValue::from_raw(raw.as_bytes()))
                .unwrap_or_default(),
            exit_code: Some(exit_code),
            duration: elapsed,
            sandbox_kind: handle.kind,
        };

        if exit_code != 0 {
            debug!(exit_code, "Function exited with error");
            return Err(FaasError::ExecutionError(Box::new(result)));
        }
        debug!(?elapsed, "Execution completed");
        Ok(result)
    }
}
