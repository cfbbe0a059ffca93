use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Which backend produced (or will produce) an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Plain container engine runtime (runc).
    Standard,
    /// gVisor (runsc) with syscall interception.
    Sandboxed,
}

impl Display for SandboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxKind::Standard => write!(f, "standard"),
            SandboxKind::Sandboxed => write!(f, "sandboxed"),
        }
    }
}

/// Opaque envelope around whatever the user function returned.
///
/// The core never looks inside `Json` or `Bytes`; it only distinguishes
/// "a value" from "no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ReturnValue {
    #[default]
    Null,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ReturnValue {
    /// Wrap raw bytes emitted by the sandbox. Valid JSON stays tagged as JSON,
    /// anything else is carried as bytes.
    pub fn from_raw(raw: &[u8]) -> Self {
        let start = raw
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(raw.len());
        let end = raw
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(start, |i| i + 1);
        let trimmed = &raw[start..end];
        if trimmed.is_empty() {
            return ReturnValue::Null;
        }
        match serde_json::from_slice::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Null) => ReturnValue::Null,
            Ok(value) => ReturnValue::Json(value),
            Err(_) => ReturnValue::Bytes(trimmed.to_vec()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ReturnValue::Null)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ReturnValue::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub return_value: ReturnValue,
    /// `None` when the process never reported an exit code (killed on timeout).
    pub exit_code: Option<i64>,
    pub duration: Duration,
    pub sandbox_kind: SandboxKind,
}

impl ExecutionResult {
    pub fn empty(sandbox_kind: SandboxKind) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            return_value: ReturnValue::Null,
            exit_code: None,
            duration: Duration::ZERO,
            sandbox_kind,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `max_chars` characters of stderr, for failure reasons.
    pub fn stderr_excerpt(&self, max_chars: usize) -> Option<String> {
        let trimmed = self.stderr.trim();
        if trimmed.is_empty() {
            return None;
        }
        let count = trimmed.chars().count();
        Some(trimmed.chars().skip(count.saturating_sub(max_chars)).collect())
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutionResult(exit_code: {:?}, duration: {:?}, sandbox: {}, return_value: {:?})",
            self.exit_code, self.duration, self.sandbox_kind, self.return_value
        )
    }
}
