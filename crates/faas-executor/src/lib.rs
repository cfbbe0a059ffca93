use bollard::errors::Error as BollardError; // Alias bollard error
use faas_common::FaasError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the binary)
pub use bollard;
pub use faas_common as common;

pub mod config;
pub mod container_pool;
pub mod engine;
pub mod metrics_collector;
pub mod queue;
pub mod runtime;
pub mod test_utils;
pub mod tracker;
pub mod worker;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Image pull failed for {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Exec failed in container {container_id}: {source}")]
    ExecFailed {
        container_id: String,
        #[source]
        source: BollardError,
    },
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
    #[error("Platform probe failed: {0}")]
    Probe(String),
    #[error("Sandbox protocol error: {0}")]
    Protocol(String),
}

// Failures before the function gets to run are infra-level; failures while it
// runs mean the sandbox itself went away.
impl From<ExecutorError> for FaasError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::CreationFailed(_)
            | ExecutorError::StartFailed(_)
            | ExecutorError::ImagePull { .. }
            | ExecutorError::DockerApi(_)
            | ExecutorError::Probe(_) => FaasError::RuntimeUnavailable(err.to_string()),
            ExecutorError::ExecFailed { .. } | ExecutorError::Protocol(_) => {
                FaasError::RuntimeCrash(err.to_string())
            }
            ExecutorError::RemovalFailed(_) => FaasError::Internal(err.to_string()),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

pub use config::{Backpressure, EngineConfig, PoolConfig, QueueConfig, RuntimeConfig, WorkerConfig};
pub use container_pool::{ContainerPool, ContainerState, PoolStats, PooledContainer};
pub use engine::Engine;
pub use metrics_collector::{JobOutcome, JobTimings, MetricsCollector, MetricsSnapshot};
pub use queue::JobQueue;
pub use runtime::{
    probe_platform, ContainerHandle, DockerBackend, Invocation, OutputSink, PlatformCapability,
    RuntimeAdapter, SandboxBackend,
};
pub use tracker::JobTracker;
pub use worker::WorkerPool;
