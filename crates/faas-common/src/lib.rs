// Re-export dependencies used in public interfaces of common types

use std::time::Duration;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod function;
mod job;
mod result;
mod store;

pub use function::{FunctionSignature, FunctionSpec, Priority, ResourceLimits, TrustTier};
pub use job::{FailureKind, FailureOrigin, FailureReason, Job, JobId, JobStatus};
pub use result::{ExecutionResult, ReturnValue, SandboxKind};
pub use store::{InMemoryStore, JobStore};

/// Error taxonomy shared by the queue, pool, runtime adapter and workers.
///
/// Infra-level variants (`RuntimeUnavailable`, `ResourceExhausted`) are retried
/// inside the worker. Execution-level variants carry whatever output was
/// captured before the failure.
#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Queue Full: admission rejected")]
    QueueFull,

    #[error("Shutting Down: engine no longer accepts work")]
    ShuttingDown,

    #[error("Runtime Unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Resource Exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Execution Timeout: exceeded {timeout:?}")]
    ExecutionTimeout {
        timeout: Duration,
        partial: Box<ExecutionResult>,
    },

    #[error("Execution Error: function exited with code {:?}", .0.exit_code)]
    ExecutionError(Box<ExecutionResult>),

    #[error("Runtime Crash: {0}")]
    RuntimeCrash(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Invalid Transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FaasError {
    /// Infra-level failures that a worker may retry before giving up.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FaasError::RuntimeUnavailable(_) | FaasError::ResourceExhausted(_)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FaasError::QueueFull => FailureKind::QueueFull,
            FaasError::RuntimeUnavailable(_) => FailureKind::RuntimeUnavailable,
            FaasError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            FaasError::ExecutionTimeout { .. } => FailureKind::ExecutionTimeout,
            FaasError::ExecutionError(_) => FailureKind::ExecutionError,
            FaasError::RuntimeCrash(_) => FailureKind::RuntimeCrash,
            FaasError::Cancelled => FailureKind::Cancelled,
            FaasError::NotFound(_) => FailureKind::FunctionNotFound,
            _ => FailureKind::Internal,
        }
    }

    /// Output captured before an execution-level failure, if any.
    pub fn captured(&self) -> Option<&ExecutionResult> {
        match self {
            FaasError::ExecutionTimeout { partial, .. } => Some(partial),
            FaasError::ExecutionError(result) => Some(result),
            _ => None,
        }
    }
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;
