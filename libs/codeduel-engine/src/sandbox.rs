/// Sandbox Abstraction - Isolated Execution Environments
///
/// **Core Responsibility:**
/// Run commands inside an isolated environment and report stdout, stderr, exit code
/// and wall time. The pool owns sandbox lifecycles; runners only exec inside them.
///
/// **Layers:**
/// - `Sandbox`: one live environment (exec, file writes)
/// - `SandboxProvider`: creates, probes and destroys environments
/// - `DockerProvider` / `DockerSandbox`: production implementation over bollard
///
/// **Timeout Model:**
/// Guest commands are wrapped in `timeout -s KILL <secs>` inside the container, and the
/// exec itself is bounded host-side by `tokio::time::timeout` with a grace period, so a
/// hung daemon or runaway program can never block the caller indefinitely.
use crate::config::{EngineSettings, LanguageConfig};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Label carried by every container this engine creates
pub const MANAGED_LABEL: &str = "codeduel.managed";

/// Extra host-side time allowed on top of the in-container limit
const HOST_GRACE: Duration = Duration::from_secs(5);

/// Base64 characters per write chunk (multiple of 4 so chunks decode independently)
const WRITE_CHUNK_CHARS: usize = 60_000;

/// Captured output beyond this is dropped
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// A command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    /// Guest wall-clock limit; None for infrastructure commands
    pub limit: Option<Duration>,
    /// Host-side bound on the whole exec round trip
    pub deadline: Duration,
}

impl ExecRequest {
    /// Infrastructure command (mkdir, rm, probes), bounded only host-side
    pub fn system<S: Into<String>>(cmd: impl IntoIterator<Item = S>, deadline: Duration) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            working_dir: None,
            limit: None,
            deadline,
        }
    }

    /// Guest program wrapped in `timeout -s KILL`
    pub fn guest<S: Into<String>>(cmd: impl IntoIterator<Item = S>, limit: Duration) -> Self {
        let secs = limit.as_secs().max(1);
        let mut wrapped = vec![
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            secs.to_string(),
        ];
        wrapped.extend(cmd.into_iter().map(Into::into));
        Self {
            cmd: wrapped,
            working_dir: None,
            limit: Some(Duration::from_secs(secs)),
            deadline: Duration::from_secs(secs) + HOST_GRACE,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Classify a finished exec against this request's limit
    pub fn finish(&self, stdout: String, stderr: String, exit_code: Option<i64>, elapsed: Duration) -> ExecOutput {
        let timed_out = match (exit_code, self.limit) {
            (Some(124), Some(_)) => true,
            (Some(137) | Some(143), Some(limit)) => elapsed >= limit,
            _ => false,
        };
        ExecOutput {
            stdout,
            stderr,
            exit_code,
            elapsed,
            timed_out,
        }
    }

    /// Output for an exec abandoned at the host deadline
    pub fn abandoned(&self, elapsed: Duration) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: "[Execution abandoned at host deadline]".to_string(),
            exit_code: None,
            elapsed,
            timed_out: true,
        }
    }
}

/// Result of one exec
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Human readable cause for well-known kill signals
    pub fn kill_note(&self) -> Option<&'static str> {
        if self.timed_out {
            return None;
        }
        match self.exit_code {
            Some(137) => Some("killed: memory limit exceeded"),
            Some(139) => Some("killed: segmentation fault"),
            _ => None,
        }
    }

    /// Short description of an abnormal exit, used when a program produced no result
    pub fn describe_exit(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mut description = format!("exit code {}", code);
        if let Some(note) = self.kill_note() {
            description.push_str(&format!(", {}", note));
        }
        if let Some(line) = self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            description.push_str(&format!(": {}", line.trim()));
        }
        description
    }
}

/// One live isolated environment
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Write `contents` to `path`, replacing any existing file
    ///
    /// Content travels as base64 in bounded argv chunks so arbitrary bytes survive
    /// without any shell quoting.
    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(contents.as_bytes());
        let truncate = ExecRequest::system(
            ["sh", "-c", ": > \"$1\"", "_", path],
            Duration::from_secs(10),
        );
        expect_ok(&self.exec(truncate).await?, path)?;

        for chunk in encoded.as_bytes().chunks(WRITE_CHUNK_CHARS) {
            let chunk = String::from_utf8_lossy(chunk).into_owned();
            let append = ExecRequest::system(
                [
                    "sh".to_string(),
                    "-c".to_string(),
                    "printf %s \"$1\" | base64 -d >> \"$2\"".to_string(),
                    "_".to_string(),
                    chunk,
                    path.to_string(),
                ],
                Duration::from_secs(10),
            );
            expect_ok(&self.exec(append).await?, path)?;
        }
        Ok(())
    }
}

fn expect_ok(output: &ExecOutput, path: &str) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(EngineError::Sandbox(format!(
            "failed to write {}: {}",
            path,
            output.describe_exit()
        )))
    }
}

/// What a pooled or ephemeral container looks like
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub labels: HashMap<String, String>,
}

impl SandboxSpec {
    pub fn for_language(config: &LanguageConfig, settings: &EngineSettings, name: String) -> Result<Self> {
        let memory_bytes = config.memory_limit_bytes().ok_or_else(|| {
            EngineError::Configuration(format!(
                "Invalid memory limit '{}' for {}",
                config.memory_limit, config.name
            ))
        })?;
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert("codeduel.language".to_string(), config.name.to_string());
        labels.insert("codeduel.prefix".to_string(), settings.container_name_prefix.clone());
        Ok(Self {
            name,
            image: config.image.clone(),
            memory_bytes,
            nano_cpus: config.nano_cpus(),
            pids_limit: settings.pids_limit,
            labels,
        })
    }
}

/// Creates, probes and destroys sandboxes
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Make sure the image is present locally (pull on miss)
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a sandbox; an existing one with the same name is replaced
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>>;

    /// Whether the sandbox is still running
    async fn is_running(&self, id: &str) -> bool;

    async fn destroy(&self, id: &str) -> Result<()>;

    /// Remove every managed container created under `prefix`; returns how many
    async fn remove_managed(&self, prefix: &str) -> Result<usize>;
}

/// Production sandbox provider backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Sandbox(format!("Failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    async fn remove_if_exists(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!(container = %name, "Removed stale container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `repo[:tag]`, leaving registry ports alone
fn split_image(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => (&image[..i], &image[i + 1..]),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("✓ Image cache hit: {}", image);
            return Ok(());
        }

        warn!("⚠ Image cache miss: {} (pulling now)", image);
        let (repo, tag) = split_image(image);
        let options = Some(CreateImageOptions {
            from_image: repo,
            tag,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::Sandbox(format!("Failed to pull image {}: {}", image, e)))?;
        }
        info!("✓ Image pulled successfully: {}", image);
        Ok(())
    }

    #[tracing::instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        self.remove_if_exists(&spec.name).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            working_dir: Some("/tmp".to_string()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                network_mode: Some("none".to_string()),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.destroy(&created.id).await {
                warn!(container_id = %created.id, error = %cleanup, "Failed to remove container that never started");
            }
            return Err(e.into());
        }

        info!(container_id = %created.id, "Sandbox container started");
        Ok(Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            id: created.id,
        }))
    }

    async fn is_running(&self, id: &str) -> bool {
        match self.docker.inspect_container(id, None::<InspectContainerOptions>).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        self.remove_if_exists(id).await
    }

    async fn remove_managed(&self, prefix: &str) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{}=true", MANAGED_LABEL),
                format!("codeduel.prefix={}", prefix),
            ],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        let mut removed = 0;
        for container in containers {
            if let Some(id) = container.id {
                self.remove_if_exists(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A running Docker container used as a sandbox
pub struct DockerSandbox {
    docker: Docker,
    id: String,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(skip(self, request), fields(container_id = %self.id))]
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let started = Instant::now();
        let options = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: request.working_dir.clone(),
            ..Default::default()
        };
        let exec = self.docker.create_exec(&self.id, options).await?;

        let collect = async {
            let start = StartExecOptions {
                detach: false,
                ..Default::default()
            };
            let mut stdout = String::new();
            let mut stderr = String::new();
            match self.docker.start_exec(&exec.id, Some(start)).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(msg) = output.next().await {
                        match msg? {
                            LogOutput::StdOut { message } => {
                                if stdout.len() < MAX_OUTPUT_BYTES {
                                    stdout.push_str(&String::from_utf8_lossy(&message));
                                }
                            }
                            LogOutput::StdErr { message } => {
                                if stderr.len() < MAX_OUTPUT_BYTES {
                                    stderr.push_str(&String::from_utf8_lossy(&message));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {
                    return Err(EngineError::Sandbox("exec did not attach".to_string()));
                }
            }
            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok::<_, EngineError>((stdout, stderr, inspect.exit_code))
        };

        match tokio::time::timeout(request.deadline, collect).await {
            Ok(result) => {
                let (stdout, stderr, exit_code) = result?;
                let output = request.finish(stdout, stderr, exit_code, started.elapsed());
                debug!(
                    exit_code = ?output.exit_code,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    timed_out = output.timed_out,
                    "Exec finished"
                );
                Ok(output)
            }
            Err(_) => {
                warn!(deadline_ms = request.deadline.as_millis() as u64, "Exec abandoned at host deadline");
                Ok(request.abandoned(started.elapsed()))
            }
        }
    }
}

/// Container cleanup guard - guarantees removal of an ephemeral container on drop
pub struct ContainerGuard {
    provider: Arc<dyn SandboxProvider>,
    container_id: String,
}

impl ContainerGuard {
    pub fn new(provider: Arc<dyn SandboxProvider>, container_id: String) -> Self {
        Self {
            provider,
            container_id,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Cannot be async in Drop; hand removal to the runtime when one is available
        let provider = self.provider.clone();
        let container_id = std::mem::take(&mut self.container_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = provider.destroy(&container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to clean up ephemeral container");
                }
            });
        }
    }
}
