use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ExecutionResult, FaasError, Result, SandboxKind};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Assigned => 1,
            JobStatus::Running => 2,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Transitions only move forward; skipping ahead (e.g. a cancelled
    /// `Queued` job going straight to `Failed`) is allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Who is to blame for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The user's code failed or ran too long.
    Function,
    /// The platform could not run the code.
    Platform,
    /// The caller withdrew the job.
    Caller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    QueueFull,
    RuntimeUnavailable,
    ResourceExhausted,
    ExecutionTimeout,
    ExecutionError,
    RuntimeCrash,
    Cancelled,
    FunctionNotFound,
    Internal,
}

impl FailureKind {
    pub fn origin(self) -> FailureOrigin {
        match self {
            FailureKind::ExecutionTimeout | FailureKind::ExecutionError => FailureOrigin::Function,
            FailureKind::Cancelled => FailureOrigin::Caller,
            _ => FailureOrigin::Platform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub origin: FailureOrigin,
    pub message: String,
    pub stderr_excerpt: Option<String>,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: kind.origin(),
            message: message.into(),
            stderr_excerpt: None,
        }
    }

    pub fn with_stderr(mut self, excerpt: Option<String>) -> Self {
        self.stderr_excerpt = excerpt;
        self
    }
}

impl From<&FaasError> for FailureReason {
    fn from(err: &FaasError) -> Self {
        let excerpt = err.captured().and_then(|r| r.stderr_excerpt(2048));
        FailureReason::new(err.failure_kind(), err.to_string()).with_stderr(excerpt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub function_id: String,
    pub input: serde_json::Value,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    pub error: Option<FailureReason>,
    pub runtime_used: Option<SandboxKind>,
}

impl Job {
    pub fn new(function_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            function_id: function_id.into(),
            input,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            runtime_used: None,
        }
    }

    fn advance(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FaasError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn assign(&mut self) -> Result<()> {
        self.advance(JobStatus::Assigned)
    }

    pub fn start(&mut self, runtime: SandboxKind) -> Result<()> {
        self.advance(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.runtime_used = Some(runtime);
        Ok(())
    }

    pub fn succeed(&mut self, result: ExecutionResult) -> Result<()> {
        self.advance(JobStatus::Succeeded)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason, result: Option<ExecutionResult>) -> Result<()> {
        self.advance(JobStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason);
        self.result = result;
        Ok(())
    }

    pub fn time_out(&mut self, reason: FailureReason, partial: ExecutionResult) -> Result<()> {
        self.advance(JobStatus::TimedOut)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason);
        self.result = Some(partial);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let mut job = Job::new("f1", serde_json::json!({}));
        job.assign().unwrap();
        job.start(SandboxKind::Standard).unwrap();
        assert!(job.started_at.is_some());
        assert_eq!(job.runtime_used, Some(SandboxKind::Standard));

        // No going back.
        assert!(matches!(
            job.assign(),
            Err(FaasError::InvalidTransition {
                from: JobStatus::Running,
                to: JobStatus::Assigned
            })
        ));

        job.succeed(ExecutionResult::empty(SandboxKind::Standard))
            .unwrap();
        assert!(job.is_terminal());
        assert!(job.completed_at.is_some());

        // Terminal is immutable.
        let reason = FailureReason::new(FailureKind::Internal, "late");
        assert!(job.fail(reason, None).is_err());
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_cancelled_queued_job_may_skip_to_failed() {
        let mut job = Job::new("f1", serde_json::Value::Null);
        job.fail(FailureReason::new(FailureKind::Cancelled, "cancelled"), None)
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().origin, FailureOrigin::Caller);
    }

    #[test]
    fn test_failure_reason_carries_stderr() {
        let mut captured = ExecutionResult::empty(SandboxKind::Sandboxed);
        captured.exit_code = Some(1);
        captured.stderr = "ValueError: boom".to_string();
        let err = FaasError::ExecutionError(Box::new(captured));

        let reason = FailureReason::from(&err);
        assert_eq!(reason.kind, FailureKind::ExecutionError);
        assert_eq!(reason.origin, FailureOrigin::Function);
        assert_eq!(reason.stderr_excerpt.as_deref(), Some("ValueError: boom"));
    }
}
