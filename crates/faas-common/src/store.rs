use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{FaasError, FunctionSpec, Job, JobId, JobStatus, Result};

/// Outbound contract to the external function/job store.
///
/// The engine calls `persist` on every status transition and treats failures
/// as best-effort: they are logged, never propagated into execution.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_function(&self, function_id: &str) -> Result<FunctionSpec>;
    async fn persist(&self, job: &Job) -> Result<()>;
}

// In-memory store for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    functions: Arc<RwLock<HashMap<String, FunctionSpec>>>,
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    transitions: Arc<RwLock<HashMap<JobId, Vec<JobStatus>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_function(&self, spec: FunctionSpec) {
        self.functions
            .write()
            .await
            .insert(spec.function_id.clone(), spec);
    }

    pub async fn job(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Every status persisted for a job, in write order.
    pub async fn transitions(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.transitions
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn load_function(&self, function_id: &str) -> Result<FunctionSpec> {
        self.functions
            .read()
            .await
            .get(function_id)
            .cloned()
            .ok_or_else(|| FaasError::NotFound(format!("function {function_id}")))
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        self.transitions
            .write()
            .await
            .entry(job.id)
            .or_default()
            .push(job.status);
        Ok(())
    }
}
