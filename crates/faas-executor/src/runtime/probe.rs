use bollard::Docker;
use faas_common::SandboxKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::{ExecutorError, Result};

const RUNSC_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One-time answer to "can this host run the gVisor backend".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapability {
    pub is_wsl: bool,
    pub sandbox_available: bool,
    pub runsc_path: Option<String>,
    pub runsc_version: Option<String>,
    pub docker_runtimes: Vec<String>,
}

impl PlatformCapability {
    pub fn standard_only() -> Self {
        Self {
            is_wsl: false,
            sandbox_available: false,
            runsc_path: None,
            runsc_version: None,
            docker_runtimes: vec!["runc".to_string()],
        }
    }

    pub fn with_sandbox(runsc_path: impl Into<String>) -> Self {
        Self {
            is_wsl: false,
            sandbox_available: true,
            runsc_path: Some(runsc_path.into()),
            runsc_version: None,
            docker_runtimes: vec!["runc".to_string(), "runsc".to_string()],
        }
    }

    pub fn preferred_runtime(&self) -> SandboxKind {
        if self.sandbox_available {
            SandboxKind::Sandboxed
        } else {
            SandboxKind::Standard
        }
    }
}

pub fn is_wsl_kernel(proc_version: &str) -> bool {
    let lower = proc_version.to_ascii_lowercase();
    lower.contains("microsoft") || lower.contains("wsl")
}

fn detect_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| is_wsl_kernel(&v))
        .unwrap_or(false)
}

/// `runsc --version` output, if the binary exists and answers in time.
async fn runsc_version(path: &str) -> Option<String> {
    let output = tokio::time::timeout(
        RUNSC_PROBE_TIMEOUT,
        Command::new(path).arg("--version").output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            text.lines().next().map(|l| l.trim().to_string())
        }
        Ok(Ok(out)) => {
            debug!(status = ?out.status, "runsc --version exited unsuccessfully");
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, path, "runsc not executable");
            None
        }
        Err(_) => {
            warn!(path, "runsc --version timed out");
            None
        }
    }
}

/// Probe the host once at startup. Fails only when the Docker daemon itself
/// is unreachable.
pub async fn probe_platform(docker: &Docker, config: &RuntimeConfig) -> Result<PlatformCapability> {
    docker
        .ping()
        .await
        .map_err(|e| ExecutorError::Probe(format!("docker daemon unreachable: {e}")))?;

    let info = docker.info().await?;
    let mut docker_runtimes: Vec<String> = info
        .runtimes
        .map(|r| r.into_keys().collect())
        .unwrap_or_default();
    docker_runtimes.sort();

    let is_wsl = detect_wsl();
    let runsc_version = runsc_version(&config.runsc_path).await;
    let registered = docker_runtimes
        .iter()
        .any(|r| r == &config.sandbox_runtime_name);

    let sandbox_available = runsc_version.is_some() && registered;
    if runsc_version.is_some() && !registered {
        warn!(
            runtime = %config.sandbox_runtime_name,
            "runsc is installed but not registered with the Docker daemon"
        );
    }

    let capability = PlatformCapability {
        is_wsl,
        sandbox_available,
        runsc_path: runsc_version.as_ref().map(|_| config.runsc_path.clone()),
        runsc_version,
        docker_runtimes,
    };
    info!(
        is_wsl,
        sandbox_available,
        runtimes = ?capability.docker_runtimes,
        "Platform probe complete"
    );
    Ok(capability)
}
