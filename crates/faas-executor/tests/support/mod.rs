//! Scripted in-process sandbox backend shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use faas_common::{
    FaasError, FunctionSignature, FunctionSpec, Priority, ResourceLimits, Result, SandboxKind,
    TrustTier,
};
use faas_executor::config::{EngineConfig, RuntimeConfig};
use faas_executor::runtime::bootstrap::encode_return;
use faas_executor::runtime::{
    ContainerHandle, Invocation, OutputSink, PlatformCapability, RuntimeAdapter, SandboxBackend,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const IMAGE: &str = "python:3.11-slim";

/// What a scripted function does when executed.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Return(Value),
    /// Write to stdout, then return.
    Print(String, Value),
    /// Print a traceback and exit 1.
    Raise(String),
    Sleep(Duration, Value),
    /// Write to stdout, then never finish.
    Forever(String),
    /// The sandbox process dies.
    Crash,
}

pub struct MockBackend {
    kind: SandboxKind,
    scripts: Mutex<HashMap<String, MockBehavior>>,
    live: Mutex<HashSet<String>>,
    max_live: AtomicUsize,
    created: AtomicUsize,
    create_attempts: AtomicUsize,
    destroyed: AtomicUsize,
    execs: AtomicUsize,
    fail_creates: AtomicUsize,
    healthy: AtomicBool,
    create_delay: Duration,
}

impl MockBackend {
    pub fn new(kind: SandboxKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(HashMap::new()),
            live: Mutex::new(HashSet::new()),
            max_live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            create_attempts: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            create_delay: Duration::ZERO,
        }
    }

    pub fn standard() -> Arc<Self> {
        Arc::new(Self::new(SandboxKind::Standard))
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn script(&self, code: &str, behavior: MockBehavior) {
        self.scripts
            .lock()
            .unwrap()
            .insert(code.to_string(), behavior);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn behavior(&self, code: &str) -> MockBehavior {
        self.scripts
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .unwrap_or(MockBehavior::Return(Value::Null))
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    async fn create(&self, signature: &FunctionSignature) -> Result<ContainerHandle> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FaasError::RuntimeUnavailable("mock daemon refused".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let live = {
            let mut live = self.live.lock().unwrap();
            live.insert(id.clone());
            live.len()
        };
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerHandle {
            name: format!("mock-{}-{}", signature.function_id, &id[..8]),
            id,
            kind: self.kind,
        })
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        invocation: &Invocation,
        sink: &OutputSink,
    ) -> Result<i64> {
        if !self.live.lock().unwrap().contains(&handle.id) {
            return Err(FaasError::RuntimeCrash(format!("container {} gone", handle.id)));
        }
        self.execs.fetch_add(1, Ordering::SeqCst);

        match self.behavior(&invocation.code) {
            MockBehavior::Return(value) => {
                sink.stdout(encode_return(&value).as_bytes()).await;
                Ok(0)
            }
            MockBehavior::Print(out, value) => {
                sink.stdout(out.as_bytes()).await;
                sink.stdout(encode_return(&value).as_bytes()).await;
                Ok(0)
            }
            MockBehavior::Raise(stderr) => {
                sink.stderr(stderr.as_bytes()).await;
                Ok(1)
            }
            MockBehavior::Sleep(duration, value) => {
                tokio::time::sleep(duration).await;
                sink.stdout(encode_return(&value).as_bytes()).await;
                Ok(0)
            }
            MockBehavior::Forever(out) => {
                sink.stdout(out.as_bytes()).await;
                std::future::pending::<()>().await;
                Ok(0)
            }
            MockBehavior::Crash => Err(FaasError::RuntimeCrash("sandbox process exited".into())),
        }
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        if self.live.lock().unwrap().remove(&handle.id) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FaasError::RuntimeUnavailable("mock backend unhealthy".into()))
        }
    }
}

pub fn runtime_config(enforce_sandbox: bool) -> RuntimeConfig {
    RuntimeConfig {
        enforce_sandbox,
        ..Default::default()
    }
}

/// Standard backend only; untrusted functions fall back to it.
pub fn standard_adapter(backend: Arc<MockBackend>) -> Arc<RuntimeAdapter> {
    Arc::new(RuntimeAdapter::new(
        PlatformCapability::standard_only(),
        backend,
        None,
        &runtime_config(false),
    ))
}

pub fn dual_adapter(
    standard: Arc<MockBackend>,
    sandboxed: Arc<MockBackend>,
    enforce_sandbox: bool,
) -> Arc<RuntimeAdapter> {
    Arc::new(RuntimeAdapter::new(
        PlatformCapability::with_sandbox("/usr/local/bin/runsc"),
        standard,
        Some(sandboxed as Arc<dyn SandboxBackend>),
        &runtime_config(enforce_sandbox),
    ))
}

pub fn trusted(function_id: &str, code: &str) -> FunctionSpec {
    FunctionSpec::new(function_id, code, IMAGE).with_trust_tier(TrustTier::Trusted)
}

pub fn signature(function_id: &str, priority: Priority) -> FunctionSignature {
    FunctionSignature {
        function_id: function_id.to_string(),
        code_hash: format!("{:0>64}", function_id.len()),
        runtime_image: IMAGE.to_string(),
        resource_limits: ResourceLimits::default(),
        sandbox_kind: SandboxKind::Standard,
        priority,
    }
}

pub fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.capacity = 16;
    config.worker.workers = 2;
    config.worker.retry_backoff = Duration::from_millis(10);
    config.worker.default_timeout = Duration::from_secs(5);
    config.pool.max_per_signature = 2;
    config.pool.max_total = 4;
    config.pool.acquire_wait = Duration::from_millis(200);
    config.runtime.enforce_sandbox = false;
    config
}
