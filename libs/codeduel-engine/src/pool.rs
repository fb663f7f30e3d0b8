/// Container Pool Manager - Warm Sandboxes per Language
///
/// **Core Responsibility:**
/// Own one long-lived sandbox per guest language and hand out leases on it.
///
/// **State Machine (per language):**
/// `Cold → Warming → Ready`, `Ready → Unhealthy → Warming` when a probe fails.
///
/// **Guarantees:**
/// - Warming happens under a language-scoped lock: the first caller creates, concurrent
///   callers wait and reuse the same container
/// - `acquire` is bounded by the startup timeout and fails with `ContainerUnavailable`
/// - Containers live until shutdown or a failed health check, never torn down per call
/// - A sandbox failure triggers teardown, recreation and exactly one retry (`with_retry`)
///
/// **Ephemeral Mode:**
/// With pooling disabled every lease gets a fresh container removed by a drop guard.
use crate::config::LanguageConfigManager;
use crate::error::{EngineError, Result};
use crate::sandbox::{ContainerGuard, ExecRequest, Sandbox, SandboxProvider, SandboxSpec};
use async_trait::async_trait;
use codeduel_common::types::Language;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a health check
enum Probe {
    Healthy,
    Failed,
    /// The worker is serving a batch; no verdict yet
    Busy,
}

/// Lifecycle of a pooled container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Cold,
    Warming,
    Ready,
    Unhealthy,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Cold => "cold",
            ContainerState::Warming => "warming",
            ContainerState::Ready => "ready",
            ContainerState::Unhealthy => "unhealthy",
        };
        write!(f, "{}", name)
    }
}

/// Language-specific setup run on every freshly created pooled container
#[async_trait]
pub trait ContainerHook: Send + Sync {
    /// Runs once after creation, before the container is marked Ready
    async fn bootstrap(&self, sandbox: &dyn Sandbox) -> Result<()>;

    /// Extra readiness check on top of "container answers exec"
    async fn probe(&self, sandbox: &dyn Sandbox) -> Result<bool>;
}

struct PooledContainer {
    state: ContainerState,
    handle: Option<Arc<dyn Sandbox>>,
    last_health_check: Option<Instant>,
    generation: u64,
    needs_probe: bool,
}

struct Slot {
    container: tokio::sync::Mutex<PooledContainer>,
    /// Serializes programs inside a persistent worker
    worker_lease: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            container: tokio::sync::Mutex::new(PooledContainer {
                state: ContainerState::Cold,
                handle: None,
                last_health_check: None,
                generation: 0,
                needs_probe: false,
            }),
            worker_lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Handle on a ready sandbox for one operation
#[derive(Clone)]
pub struct ContainerLease {
    pub language: Language,
    pub sandbox: Arc<dyn Sandbox>,
    /// Container generation this lease was issued for
    pub generation: u64,
    pub worker_lease: Arc<tokio::sync::Mutex<()>>,
    guard: Option<Arc<ContainerGuard>>,
}

impl ContainerLease {
    pub fn is_ephemeral(&self) -> bool {
        self.guard.is_some()
    }
}

/// Snapshot of one language's pool entry
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub language: Language,
    pub state: ContainerState,
    pub generation: u64,
    pub container_id: Option<String>,
    /// A health probe runs on the next acquire
    pub probe_due: bool,
}

pub struct PoolManager {
    provider: Arc<dyn SandboxProvider>,
    config: Arc<LanguageConfigManager>,
    hooks: HashMap<Language, Arc<dyn ContainerHook>>,
    slots: Mutex<HashMap<Language, Arc<Slot>>>,
}

impl PoolManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: Arc<LanguageConfigManager>) -> Self {
        Self {
            provider,
            config,
            hooks: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register setup for containers of `language`
    pub fn with_hook(mut self, language: Language, hook: Arc<dyn ContainerHook>) -> Self {
        self.hooks.insert(language, hook);
        self
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    fn slot(&self, language: Language) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(language)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slots(&self) -> Vec<(Language, Arc<Slot>)> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.iter().map(|(l, s)| (*l, s.clone())).collect()
    }

    fn container_name(&self, language: Language) -> String {
        format!("{}-{}-runner", self.config.settings().container_name_prefix, language)
    }

    /// Lease a Ready sandbox for `language`, warming or recreating it when needed
    ///
    /// ## Returns
    /// A lease on a Ready container, or `ContainerUnavailable` once the startup timeout elapses
    #[tracing::instrument(skip(self), fields(language = %language))]
    pub async fn acquire(&self, language: Language) -> Result<ContainerLease> {
        self.config.get_config(language)?;
        let settings = self.config.settings();
        if !settings.use_persistent_containers {
            return self.acquire_ephemeral(language).await;
        }

        let startup = settings.container_startup_timeout;
        let slot = self.slot(language);
        let mut pooled = tokio::time::timeout(startup, slot.container.lock())
            .await
            .map_err(|_| EngineError::ContainerUnavailable {
                language,
                reason: format!("timed out after {:?} waiting for the warm-up lock", startup),
            })?;

        if pooled.state == ContainerState::Ready {
            let due = pooled.needs_probe
                || pooled
                    .last_health_check
                    .map_or(true, |t| t.elapsed() >= settings.health_check_interval);
            if due {
                let verdict = match &pooled.handle {
                    Some(handle) => self.probe(language, handle.as_ref(), &slot.worker_lease).await,
                    None => Probe::Failed,
                };
                match verdict {
                    Probe::Healthy => {
                        pooled.last_health_check = Some(Instant::now());
                        pooled.needs_probe = false;
                    }
                    // Check stays due for the next acquire
                    Probe::Busy => {}
                    Probe::Failed => {
                        warn!(language = %language, generation = pooled.generation, "Pooled container failed health check");
                        pooled.state = ContainerState::Unhealthy;
                        if let Some(handle) = pooled.handle.take() {
                            if let Err(e) = self.provider.destroy(handle.id()).await {
                                warn!(language = %language, error = %e, "Failed to remove unhealthy container");
                            }
                        }
                    }
                }
            }
        }

        if pooled.state != ContainerState::Ready {
            pooled.state = ContainerState::Warming;
            println!("→ Warming {} container", language);
            let started = Instant::now();
            match tokio::time::timeout(startup, self.start_container(language, self.container_name(language))).await {
                Ok(Ok(handle)) => {
                    pooled.generation += 1;
                    pooled.handle = Some(handle);
                    pooled.state = ContainerState::Ready;
                    pooled.last_health_check = Some(Instant::now());
                    pooled.needs_probe = false;
                    info!(
                        language = %language,
                        generation = pooled.generation,
                        warmup_ms = started.elapsed().as_millis() as u64,
                        "Pooled container ready"
                    );
                }
                Ok(Err(e)) => {
                    pooled.state = ContainerState::Cold;
                    warn!(language = %language, error = %e, "Pooled container failed to start");
                    return Err(EngineError::ContainerUnavailable {
                        language,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    pooled.state = ContainerState::Cold;
                    // The half-built container keeps its well-known name; the next attempt replaces it
                    return Err(EngineError::ContainerUnavailable {
                        language,
                        reason: format!("not ready within {:?}", startup),
                    });
                }
            }
        }

        let sandbox = pooled.handle.clone().ok_or_else(|| EngineError::ContainerUnavailable {
            language,
            reason: "ready container has no handle".to_string(),
        })?;
        Ok(ContainerLease {
            language,
            sandbox,
            generation: pooled.generation,
            worker_lease: slot.worker_lease.clone(),
            guard: None,
        })
    }

    async fn acquire_ephemeral(&self, language: Language) -> Result<ContainerLease> {
        let name = format!(
            "{}-{}-{}",
            self.config.settings().container_name_prefix,
            language,
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let startup = self.config.settings().container_startup_timeout;
        let sandbox = tokio::time::timeout(startup, self.create_sandbox(language, name))
            .await
            .map_err(|_| EngineError::ContainerUnavailable {
                language,
                reason: format!("not ready within {:?}", startup),
            })?
            .map_err(|e| EngineError::ContainerUnavailable {
                language,
                reason: e.to_string(),
            })?;
        let guard = ContainerGuard::new(self.provider.clone(), sandbox.id().to_string());
        Ok(ContainerLease {
            language,
            sandbox,
            generation: 0,
            worker_lease: Arc::new(tokio::sync::Mutex::new(())),
            guard: Some(Arc::new(guard)),
        })
    }

    async fn create_sandbox(&self, language: Language, name: String) -> Result<Arc<dyn Sandbox>> {
        let config = self.config.get_config(language)?;
        self.provider.ensure_image(&config.image).await?;
        let spec = SandboxSpec::for_language(config, self.config.settings(), name)?;
        self.provider.create(&spec).await
    }

    async fn start_container(&self, language: Language, name: String) -> Result<Arc<dyn Sandbox>> {
        let sandbox = self.create_sandbox(language, name).await?;
        if let Some(hook) = self.hooks.get(&language) {
            if let Err(e) = hook.bootstrap(sandbox.as_ref()).await {
                if let Err(cleanup) = self.provider.destroy(sandbox.id()).await {
                    warn!(language = %language, error = %cleanup, "Failed to remove container after bootstrap failure");
                }
                return Err(e);
            }
        }
        Ok(sandbox)
    }

    /// Liveness check; the hook probe is skipped while a batch holds the worker lease
    async fn probe(&self, language: Language, sandbox: &dyn Sandbox, worker_lease: &tokio::sync::Mutex<()>) -> Probe {
        if !self.provider.is_running(sandbox.id()).await {
            return Probe::Failed;
        }
        match sandbox.exec(ExecRequest::system(["true"], PROBE_TIMEOUT)).await {
            Ok(output) if output.success() => {}
            _ => return Probe::Failed,
        }
        let Some(hook) = self.hooks.get(&language) else {
            return Probe::Healthy;
        };
        match worker_lease.try_lock() {
            Ok(_idle) => match hook.probe(sandbox).await {
                Ok(true) => Probe::Healthy,
                _ => Probe::Failed,
            },
            Err(_) => {
                // The worker only answers PING once the running batch is done
                debug!(language = %language, "Worker busy; deferring hook probe");
                Probe::Busy
            }
        }
    }

    /// Tear down the container a lease was issued for, unless it was already replaced
    pub async fn invalidate(&self, lease: &ContainerLease) {
        if lease.is_ephemeral() {
            return;
        }
        let slot = self.slot(lease.language);
        let mut pooled = slot.container.lock().await;
        if pooled.generation != lease.generation {
            return;
        }
        warn!(language = %lease.language, generation = lease.generation, "Invalidating pooled container");
        pooled.state = ContainerState::Unhealthy;
        if let Some(handle) = pooled.handle.take() {
            if let Err(e) = self.provider.destroy(handle.id()).await {
                warn!(error = %e, "Failed to remove invalidated container");
            }
        }
    }

    /// Force a health probe on the next acquire (after a guest timeout, for instance)
    pub async fn mark_for_health_check(&self, language: Language) {
        let slot = self.slot(language);
        let mut pooled = slot.container.lock().await;
        if pooled.state == ContainerState::Ready {
            pooled.needs_probe = true;
        }
    }

    /// Run `op` on a leased sandbox; a sandbox failure recreates the container and retries once
    pub async fn with_retry<T, F, Fut>(&self, language: Language, mut op: F) -> Result<T>
    where
        F: FnMut(ContainerLease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(language).await?;
        match op(lease.clone()).await {
            Err(e) if e.is_sandbox_failure() => {
                warn!(language = %language, error = %e, "Sandbox failure; recreating container and retrying once");
                self.invalidate(&lease).await;
                drop(lease);
                let lease = self.acquire(language).await?;
                op(lease).await
            }
            other => other,
        }
    }

    /// Start containers for `languages` concurrently
    pub async fn warm_up(&self, languages: &[Language]) -> Vec<(Language, Result<()>)> {
        let attempts = languages.iter().map(|&language| async move {
            let result = self.acquire(language).await.map(|_| ());
            (language, result)
        });
        join_all(attempts).await
    }

    /// Remove scratch directories older than ten minutes left behind in Ready containers
    pub async fn sweep_scratch(&self) -> usize {
        let mut swept = 0;
        for (language, slot) in self.existing_slots() {
            let handle = {
                let pooled = slot.container.lock().await;
                match (&pooled.state, &pooled.handle) {
                    (ContainerState::Ready, Some(handle)) => handle.clone(),
                    _ => continue,
                }
            };
            let request = ExecRequest::system(
                [
                    "sh",
                    "-c",
                    "find /tmp -maxdepth 1 -name 'submission_*' -mmin +10 -exec rm -rf {} +",
                ],
                Duration::from_secs(30),
            );
            match handle.exec(request).await {
                Ok(output) if output.success() => swept += 1,
                Ok(output) => warn!(language = %language, detail = %output.describe_exit(), "Scratch sweep failed"),
                Err(e) => warn!(language = %language, error = %e, "Scratch sweep failed"),
            }
        }
        debug!(containers = swept, "Scratch sweep complete");
        swept
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        let mut statuses = Vec::new();
        for (language, slot) in self.existing_slots() {
            let pooled = slot.container.lock().await;
            statuses.push(PoolStatus {
                language,
                state: pooled.state,
                generation: pooled.generation,
                container_id: pooled.handle.as_ref().map(|h| h.id().to_string()),
                probe_due: pooled.needs_probe,
            });
        }
        statuses.sort_by_key(|s| s.language);
        statuses
    }

    /// Destroy every pooled container
    pub async fn shutdown(&self) {
        for (language, slot) in self.existing_slots() {
            let mut pooled = slot.container.lock().await;
            if let Some(handle) = pooled.handle.take() {
                match self.provider.destroy(handle.id()).await {
                    Ok(()) => info!(language = %language, "Pooled container removed"),
                    Err(e) => warn!(language = %language, error = %e, "Failed to remove pooled container"),
                }
            }
            pooled.state = ContainerState::Cold;
        }
    }

    /// Remove every labelled container under this prefix, including ones from earlier processes
    pub async fn teardown_managed(&self) -> Result<usize> {
        self.provider
            .remove_managed(&self.config.settings().container_name_prefix)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, FakeScript};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(provider: Arc<FakeProvider>) -> PoolManager {
        PoolManager::new(provider, Arc::new(LanguageConfigManager::builtin()))
    }

    #[tokio::test]
    async fn test_acquire_warms_once_and_reuses() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = Arc::new(pool(provider.clone()));

        let (a, b) = tokio::join!(pool.acquire(Language::Python), pool.acquire(Language::Python));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.sandbox.id(), b.sandbox.id());
        assert_eq!(provider.created(), 1);
        assert_eq!(a.sandbox.id(), "codeduel-python-runner");

        let status = pool.status().await;
        assert_eq!(status[0].state, ContainerState::Ready);
        assert_eq!(status[0].generation, 1);
    }

    #[tokio::test]
    async fn test_dead_container_is_recreated_on_probe() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = pool(provider.clone());

        let first = pool.acquire(Language::Java).await.unwrap();
        provider.kill(first.sandbox.id());
        pool.mark_for_health_check(Language::Java).await;

        let second = pool.acquire(Language::Java).await.unwrap();
        assert_eq!(provider.created(), 2);
        assert_eq!(second.generation, 2);
        assert!(provider.destroyed().contains(&first.sandbox.id().to_string()));
    }

    #[tokio::test]
    async fn test_failed_removal_does_not_block_recreation() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = pool(provider.clone());

        let first = pool.acquire(Language::Python).await.unwrap();
        provider.kill(first.sandbox.id());
        provider.fail_destroys(true);
        pool.mark_for_health_check(Language::Python).await;

        let second = pool.acquire(Language::Python).await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(provider.created(), 2);
        assert_eq!(provider.destroyed(), vec![first.sandbox.id().to_string()]);
    }

    /// Hook whose probe always reports an unhealthy worker
    struct FailingProbe {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl ContainerHook for FailingProbe {
        async fn bootstrap(&self, _sandbox: &dyn Sandbox) -> Result<()> {
            Ok(())
        }

        async fn probe(&self, _sandbox: &dyn Sandbox) -> Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_busy_worker_is_not_probed() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let hook = Arc::new(FailingProbe {
            probes: AtomicUsize::new(0),
        });
        let pool = pool(provider.clone()).with_hook(Language::Java, hook.clone());

        let first = pool.acquire(Language::Java).await.unwrap();
        let batch_in_flight = first.worker_lease.clone().lock_owned().await;
        pool.mark_for_health_check(Language::Java).await;

        let during = pool.acquire(Language::Java).await.unwrap();
        assert_eq!(during.generation, first.generation);
        assert_eq!(hook.probes.load(Ordering::SeqCst), 0);
        assert_eq!(provider.created(), 1);

        // Once idle, the still-pending probe runs and replaces the container
        drop(batch_in_flight);
        let after = pool.acquire(Language::Java).await.unwrap();
        assert_eq!(hook.probes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.created(), 2);
        assert_eq!(after.generation, first.generation + 1);
    }

    #[tokio::test]
    async fn test_with_retry_recreates_exactly_once() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = pool(provider.clone());
        let calls = AtomicUsize::new(0);

        let result = pool
            .with_retry(Language::Cpp, |lease| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(EngineError::Sandbox(format!("{} vanished", lease.sandbox.id())))
                    } else {
                        Ok(lease.generation)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.created(), 2);

        // A second sandbox failure surfaces instead of looping
        let result: Result<()> = pool
            .with_retry(Language::Cpp, |_| async { Err(EngineError::Sandbox("still broken".into())) })
            .await;
        assert!(matches!(result, Err(EngineError::Sandbox(_))));
    }

    #[tokio::test]
    async fn test_user_errors_are_not_retried() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = pool(provider.clone());
        let calls = AtomicUsize::new(0);
        let result: Result<()> = pool
            .with_retry(Language::Python, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::InvalidSubmission("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_container_unavailable() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        provider.fail_creates(true);
        let pool = pool(provider.clone());
        let result = pool.acquire(Language::JavaScript).await;
        assert!(matches!(
            result,
            Err(EngineError::ContainerUnavailable { language: Language::JavaScript, .. })
        ));

        provider.fail_creates(false);
        assert!(pool.acquire(Language::JavaScript).await.is_ok());
    }

    #[tokio::test]
    async fn test_ephemeral_mode_creates_per_lease() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let mut config = LanguageConfigManager::builtin();
        config.settings_mut().use_persistent_containers = false;
        let pool = PoolManager::new(provider.clone(), Arc::new(config));

        let a = pool.acquire(Language::Python).await.unwrap();
        let b = pool.acquire(Language::Python).await.unwrap();
        assert_ne!(a.sandbox.id(), b.sandbox.id());
        assert!(a.is_ephemeral());
        let id = a.sandbox.id().to_string();
        drop(a);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(provider.destroyed().contains(&id));
    }

    #[tokio::test]
    async fn test_shutdown_destroys_pooled_containers() {
        let provider = Arc::new(FakeProvider::new(FakeScript::ok()));
        let pool = pool(provider.clone());
        let results = pool.warm_up(&[Language::Python, Language::Cpp]).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        pool.shutdown().await;
        assert_eq!(provider.destroyed().len(), 2);
        assert!(pool.status().await.iter().all(|s| s.state == ContainerState::Cold));
    }
}
