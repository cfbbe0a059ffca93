use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{self, eyre, WrapErr};
use faas_common::{FunctionSpec, InMemoryStore, JobStatus, TrustTier};
use faas_executor::bollard::Docker;
use faas_executor::runtime::{
    probe_platform, DockerBackend, PlatformCapability, RuntimeAdapter, SandboxBackend,
};
use faas_executor::{Engine, EngineConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Extra wait on top of the function timeout, covering image pulls and
/// container creation.
const RUN_GRACE: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "faas-engine")]
#[command(version, about = "Sandboxed function execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report Docker runtimes and whether gVisor is usable on this host.
    Probe,
    /// Execute a function file once and print the finished job as JSON.
    Run(RunArgs),
    /// Boot the engine and idle until Ctrl-C.
    Serve(ServeArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Python source file.
    file: PathBuf,
    #[arg(long, env = "FAAS_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,
    /// JSON handed to the function as `event`.
    #[arg(long, default_value = "{}")]
    input: String,
    /// Wall-clock budget in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Allow the standard runtime for this function.
    #[arg(long)]
    trusted: bool,
}

#[derive(Args)]
struct ServeArgs {
    /// Directory of `*.py` files, each registered under its file stem.
    #[arg(long)]
    functions: Option<PathBuf>,
    #[arg(long, env = "FAAS_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,
    /// Containers to pre-warm per registered function.
    #[arg(long, default_value_t = 0)]
    warm: usize,
    #[arg(long)]
    trusted: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().wrap_err("Invalid FAAS_* configuration")?;
    let docker = Arc::new(
        Docker::connect_with_local_defaults().wrap_err("Failed to connect to Docker daemon")?,
    );
    let capability = probe_platform(&docker, &config.runtime).await?;

    match cli.command {
        Command::Probe => {
            println!("{}", serde_json::to_string_pretty(&capability)?);
            Ok(())
        }
        Command::Run(args) => run_once(config, docker, capability, args).await,
        Command::Serve(args) => serve(config, docker, capability, args).await,
    }
}

fn build_adapter(
    config: &EngineConfig,
    docker: Arc<Docker>,
    capability: PlatformCapability,
) -> Arc<RuntimeAdapter> {
    let sandboxed: Option<Arc<dyn SandboxBackend>> = if capability.sandbox_available {
        Some(Arc::new(DockerBackend::sandboxed(
            docker.clone(),
            config.runtime.clone(),
        )))
    } else {
        warn!("gVisor unavailable, only the standard runtime will be used");
        None
    };
    let standard = Arc::new(DockerBackend::standard(docker, config.runtime.clone()));
    Arc::new(RuntimeAdapter::new(
        capability,
        standard,
        sandboxed,
        &config.runtime,
    ))
}

async fn run_once(
    config: EngineConfig,
    docker: Arc<Docker>,
    capability: PlatformCapability,
    args: RunArgs,
) -> eyre::Result<()> {
    let input: Value = serde_json::from_str(&args.input).wrap_err("--input is not valid JSON")?;
    let mut spec = function_from_file(&args.file, &args.image, args.trusted).await?;
    if let Some(secs) = args.timeout {
        spec = spec.with_timeout(Duration::from_secs(secs));
    }
    let budget = spec.timeout.unwrap_or(config.worker.default_timeout) + RUN_GRACE;

    let store = InMemoryStore::new();
    store.register_function(spec.clone()).await;
    let adapter = build_adapter(&config, docker, capability);
    let engine = Engine::start(config, adapter, Arc::new(store))?;

    let job_id = engine.submit(&spec.function_id, input).await?;
    info!(%job_id, function_id = %spec.function_id, "Submitted");
    let job = engine.wait_for(&job_id, budget).await;
    engine.shutdown().await;
    let job = job?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    match job.status {
        JobStatus::Succeeded => Ok(()),
        status => Err(eyre!("job {job_id} finished as {status:?}")),
    }
}

async fn serve(
    config: EngineConfig,
    docker: Arc<Docker>,
    capability: PlatformCapability,
    args: ServeArgs,
) -> eyre::Result<()> {
    let store = InMemoryStore::new();
    let mut function_ids = Vec::new();
    if let Some(dir) = &args.functions {
        for path in function_files(dir).await? {
            let spec = function_from_file(&path, &args.image, args.trusted).await?;
            info!(function_id = %spec.function_id, path = %path.display(), "Registered function");
            function_ids.push(spec.function_id.clone());
            store.register_function(spec).await;
        }
    }

    let adapter = build_adapter(&config, docker, capability);
    let engine = Engine::start(config, adapter, Arc::new(store))?;

    if args.warm > 0 {
        for function_id in &function_ids {
            match engine.warm_function(function_id, args.warm).await {
                Ok(created) => info!(%function_id, created, "Pre-warmed"),
                Err(e) => warn!(%function_id, error = %e, "Pre-warm failed"),
            }
        }
    }

    info!(functions = function_ids.len(), "Engine ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for Ctrl-C")?;

    engine.shutdown().await;
    info!(
        metrics = %serde_json::to_string(&engine.metrics().await)?,
        "Final metrics"
    );
    Ok(())
}

async fn function_from_file(path: &Path, image: &str, trusted: bool) -> eyre::Result<FunctionSpec> {
    let code = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let function_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| eyre!("Cannot derive a function id from {}", path.display()))?;
    let tier = if trusted {
        TrustTier::Trusted
    } else {
        TrustTier::Untrusted
    };
    Ok(FunctionSpec::new(function_id, code, image).with_trust_tier(tier))
}

/// `*.py` files directly under `dir`, sorted by name.
async fn function_files(dir: &Path) -> eyre::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .wrap_err_with(|| format!("Failed to list {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "py") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "faas-engine",
            "run",
            "hello.py",
            "--input",
            r#"{"n": 3}"#,
            "--timeout",
            "5",
            "--trusted",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.file, PathBuf::from("hello.py"));
                assert_eq!(args.timeout, Some(5));
                assert!(args.trusted);
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_function_from_file_uses_stem_as_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resize.py");
        std::fs::write(&path, "return event['w'] * 2").unwrap();

        let spec = function_from_file(&path, DEFAULT_IMAGE, false).await.unwrap();
        assert_eq!(spec.function_id, "resize");
        assert_eq!(spec.code, "return event['w'] * 2");
        assert_eq!(spec.trust_tier, TrustTier::Untrusted);
    }

    #[tokio::test]
    async fn test_function_files_only_lists_python() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.py"), "pass").unwrap();
        std::fs::write(dir.path().join("a.py"), "pass").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("pkg.py")).unwrap();

        let files = function_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.py", "b.py"]);
    }
}
