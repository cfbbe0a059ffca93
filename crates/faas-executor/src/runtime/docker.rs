use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use faas_common::{FaasError, FunctionSignature, Result, SandboxKind};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::bootstrap;
use super::{ContainerHandle, Invocation, OutputSink, SandboxBackend};
use crate::config::RuntimeConfig;
use crate::ExecutorError;

pub const LABEL_MANAGED: &str = "faas.managed";
pub const LABEL_FUNCTION: &str = "faas.function_id";
pub const LABEL_CODE_HASH: &str = "faas.code_hash";
pub const LABEL_RUNTIME: &str = "faas.sandbox_kind";

/// Docker-backed sandbox. The same type serves both kinds; the sandboxed
/// variant runs containers under the gVisor runtime with extra hardening.
pub struct DockerBackend {
    docker: Arc<Docker>,
    kind: SandboxKind,
    config: RuntimeConfig,
}

impl DockerBackend {
    pub fn standard(docker: Arc<Docker>, config: RuntimeConfig) -> Self {
        Self {
            docker,
            kind: SandboxKind::Standard,
            config,
        }
    }

    pub fn sandboxed(docker: Arc<Docker>, config: RuntimeConfig) -> Self {
        Self {
            docker,
            kind: SandboxKind::Sandboxed,
            config,
        }
    }

    async fn ensure_image(&self, image: &str) -> crate::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|source| ExecutorError::ImagePull {
                image: image.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn host_config(&self, signature: &FunctionSignature) -> HostConfig {
        let limits = signature.resource_limits;
        let mut host_config = HostConfig {
            memory: Some(i64::from(limits.memory_mb) * 1024 * 1024),
            nano_cpus: Some(i64::from(limits.cpu_millis) * 1_000_000),
            pids_limit: Some(i64::from(limits.pids)),
            ..Default::default()
        };

        if self.config.network_disabled {
            host_config.network_mode = Some("none".to_string());
        }

        if self.kind == SandboxKind::Sandboxed {
            host_config.runtime = Some(self.config.sandbox_runtime_name.clone());
            host_config.network_mode = Some("none".to_string());
            host_config.cap_drop = Some(vec!["ALL".to_string()]);
            host_config.security_opt = Some(vec!["no-new-privileges".to_string()]);
        }
        host_config
    }

    async fn create_container(&self, signature: &FunctionSignature) -> crate::Result<ContainerHandle> {
        self.ensure_image(&signature.runtime_image).await?;

        let name = format!(
            "faas-{}-{}",
            signature
                .function_id
                .replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "-"),
            Uuid::new_v4()
        );

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_FUNCTION.to_string(), signature.function_id.clone()),
            (LABEL_CODE_HASH.to_string(), signature.code_hash.clone()),
            (LABEL_RUNTIME.to_string(), self.kind.to_string()),
        ]);

        let config = ContainerConfig {
            image: Some(signature.runtime_image.clone()),
            cmd: Some(self.config.keepalive_command.clone()),
            labels: Some(labels),
            host_config: Some(self.host_config(signature)),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(ExecutorError::CreationFailed)?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&created.id, None)
            .await
        {
            if let Err(cleanup) = self.remove(&created.id).await {
                warn!(
                    container_id = %created.id,
                    error = %cleanup,
                    "Failed to remove container that did not start"
                );
            }
            return Err(ExecutorError::StartFailed(e));
        }

        debug!(container_id = %created.id, %name, "Container started");
        Ok(ContainerHandle {
            id: created.id,
            name,
            kind: self.kind,
        })
    }

    async fn run_exec(
        &self,
        handle: &ContainerHandle,
        invocation: &Invocation,
        sink: &OutputSink,
    ) -> crate::Result<i64> {
        let exec_failed = |source: BollardError| ExecutorError::ExecFailed {
            container_id: handle.id.clone(),
            source,
        };

        let mut cmd = self.config.interpreter.clone();
        cmd.push(bootstrap::LAUNCHER.to_string());

        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(exec_failed)?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(exec_failed)?;

        match started {
            StartExecResults::Attached { mut output, mut input } => {
                let payload = bootstrap::envelope(&invocation.code, &invocation.input);
                input
                    .write_all(&payload)
                    .await
                    .map_err(|e| ExecutorError::Protocol(format!("stdin write failed: {e}")))?;
                // EOF for the launcher's json.load
                if let Err(e) = input.shutdown().await {
                    warn!(container_id = %handle.id, error = %e, "Failed to close exec stdin");
                }

                while let Some(chunk) = output.next().await {
                    match chunk.map_err(exec_failed)? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            sink.stdout(&message).await;
                        }
                        LogOutput::StdErr { message } => sink.stderr(&message).await,
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ExecutorError::Protocol("exec started detached".into()));
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await.map_err(exec_failed)?;
        inspected
            .exit_code
            .ok_or_else(|| ExecutorError::Protocol("exec finished without exit code".into()))
    }

    async fn remove(&self, container_id: &str) -> crate::Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ExecutorError::RemovalFailed(e)),
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    #[instrument(skip(self, signature), fields(signature = %signature, runtime = %self.kind))]
    async fn create(&self, signature: &FunctionSignature) -> Result<ContainerHandle> {
        Ok(self.create_container(signature).await?)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        invocation: &Invocation,
        sink: &OutputSink,
    ) -> Result<i64> {
        Ok(self.run_exec(handle, invocation, sink).await?)
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        self.remove(&handle.id).await?;
        debug!(container_id = %handle.id, "Container removed");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| FaasError::RuntimeUnavailable(format!("docker ping failed: {e}")))?;

        if self.kind == SandboxKind::Sandboxed {
            let info = self.docker.info().await.map_err(ExecutorError::DockerApi)?;
            let registered = info
                .runtimes
                .map(|r| r.contains_key(&self.config.sandbox_runtime_name))
                .unwrap_or(false);
            if !registered {
                warn!(runtime = %self.config.sandbox_runtime_name, "Sandbox runtime no longer registered");
                return Err(FaasError::RuntimeUnavailable(format!(
                    "docker runtime {} not registered",
                    self.config.sandbox_runtime_name
                )));
            }
        }
        Ok(())
    }
}
