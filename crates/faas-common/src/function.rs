use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::time::Duration;

use crate::SandboxKind;

/// Whether a function may run outside the hardened sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Trusted,
    /// Requires the sandboxed backend when the platform has one.
    #[default]
    Untrusted,
}

/// Eviction priority of a signature's warm containers. Declaration order is
/// the ordering: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// CPU quota in thousandths of a core.
    pub cpu_millis: u32,
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_millis: 500,
            pids: 64,
        }
    }
}

/// Function metadata as returned by the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub function_id: String,
    pub code: String,
    pub runtime_image: String,
    #[serde(default)]
    pub trust_tier: TrustTier,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Per-function wall-clock budget; the engine default applies when unset.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub priority: Priority,
}

impl FunctionSpec {
    pub fn new(
        function_id: impl Into<String>,
        code: impl Into<String>,
        runtime_image: impl Into<String>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            code: code.into(),
            runtime_image: runtime_image.into(),
            trust_tier: TrustTier::default(),
            resource_limits: ResourceLimits::default(),
            timeout: None,
            priority: Priority::default(),
        }
    }

    pub fn with_trust_tier(mut self, trust_tier: TrustTier) -> Self {
        self.trust_tier = trust_tier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, resource_limits: ResourceLimits) -> Self {
        self.resource_limits = resource_limits;
        self
    }

    pub fn code_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.code.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Pool key. Two jobs share warm containers only when every field matches,
/// including the backend the container was created on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub function_id: String,
    pub code_hash: String,
    pub runtime_image: String,
    pub resource_limits: ResourceLimits,
    pub sandbox_kind: SandboxKind,
    pub priority: Priority,
}

impl FunctionSignature {
    pub fn derive(spec: &FunctionSpec, sandbox_kind: SandboxKind) -> Self {
        Self {
            function_id: spec.function_id.clone(),
            code_hash: spec.code_hash(),
            runtime_image: spec.runtime_image.clone(),
            resource_limits: spec.resource_limits,
            sandbox_kind,
            priority: spec.priority,
        }
    }
}

impl Display for FunctionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = &self.code_hash[..self.code_hash.len().min(12)];
        write!(
            f,
            "{}@{}[{}/{}]",
            self.function_id, short, self.runtime_image, self.sandbox_kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_tracks_code_identity() {
        let a = FunctionSpec::new("f1", "return 1", "python:3.11-slim");
        let b = FunctionSpec::new("f1", "return 2", "python:3.11-slim");

        let sig_a = FunctionSignature::derive(&a, SandboxKind::Standard);
        let sig_a2 = FunctionSignature::derive(&a, SandboxKind::Standard);
        let sig_b = FunctionSignature::derive(&b, SandboxKind::Standard);
        let sig_a_sandboxed = FunctionSignature::derive(&a, SandboxKind::Sandboxed);

        assert_eq!(sig_a, sig_a2);
        assert_ne!(sig_a, sig_b);
        assert_ne!(sig_a, sig_a_sandboxed);
        assert_eq!(sig_a.code_hash.len(), 64);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: FunctionSpec = serde_json::from_value(serde_json::json!({
            "function_id": "hello",
            "code": "return 1",
            "runtime_image": "python:3.11-slim"
        }))
        .unwrap();
        assert_eq!(spec.trust_tier, TrustTier::Untrusted);
        assert_eq!(spec.resource_limits.memory_mb, 128);
        assert!(spec.timeout.is_none());
    }
}
