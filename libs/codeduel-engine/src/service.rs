/// Orchestration Service - Single Entry Point of the Engine
///
/// **Core Responsibility:**
/// `execute_test_cases(submission) -> RunResponse`, tying together:
/// 1. Language resolution and submission validation
/// 2. Problem and signature lookup
/// 3. Strategy choice (per-case / compile-once / persistent worker)
/// 4. Pooled sandbox lease with one recreate-and-retry on sandbox failure
/// 5. Batch → per-case fallback on protocol failures
/// 6. Comparison and the structured response
///
/// **Boundary Guarantee:**
/// Every failure, including a panicked task, becomes a `RunResponse` with
/// `success = false`, an error string and an `ErrorKind`.
///
/// **Concurrency:**
/// Submissions run on independent tasks gated by a fixed-size semaphore.
use crate::adapter::{Runner, RunnerRegistry};
use crate::batch::{java_worker_hook, run_compile_once, run_per_case, run_persistent_worker, BatchJob, BatchOutcome};
use crate::config::{BatchStrategy, LanguageConfigManager};
use crate::error::{EngineError, Result};
use crate::evaluator::{evaluate, COMPILE_FAILED_PREFIX, TIMEOUT_ERROR};
use crate::pool::{ContainerLease, PoolManager};
use crate::registry::{Param, ParamType, Problem, ProblemStore, Signature};
use crate::sandbox::SandboxProvider;
use codeduel_common::types::{ErrorKind, Language, RunResponse, Submission, TestCase, TestSelection};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Maximum source code size accepted (1MB)
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

pub struct ExecutionService {
    config: Arc<LanguageConfigManager>,
    problems: Arc<dyn ProblemStore>,
    pool: Arc<PoolManager>,
    runners: Arc<RunnerRegistry>,
    permits: Arc<Semaphore>,
}

/// Cases chosen for one submission
fn select_cases(problem: &Problem, selection: &TestSelection) -> Result<Vec<TestCase>> {
    let cases: Vec<TestCase> = match selection {
        TestSelection::All => problem.tests.clone(),
        TestSelection::Sample { count } => problem.tests.iter().take(*count).cloned().collect(),
        TestSelection::Custom { cases } => cases.clone(),
    };
    if cases.is_empty() {
        return Err(EngineError::InvalidSubmission(format!(
            "no test cases selected for problem '{}'",
            problem.id
        )));
    }
    Ok(cases)
}

/// Run one batch with the chosen strategy, re-running per case when the batch transport breaks
async fn run_batch(
    runner: &dyn Runner,
    lease: &ContainerLease,
    strategy: BatchStrategy,
    worker_port: u16,
    job: &BatchJob<'_>,
) -> Result<BatchOutcome> {
    let batch = match strategy {
        BatchStrategy::PerCase => return run_per_case(runner, lease, job).await,
        BatchStrategy::CompileOnce => run_compile_once(runner, lease, job).await,
        BatchStrategy::PersistentWorker => run_persistent_worker(runner, lease, worker_port, job).await,
    };

    match batch {
        Err(EngineError::Protocol(reason)) => {
            warn!(
                language = %lease.language,
                strategy = %strategy,
                reason = %reason,
                "Batch failed; falling back to per-case execution"
            );
            match run_per_case(runner, lease, job).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_sandbox_failure() => Err(e),
                Err(e) => Err(EngineError::Protocol(format!(
                    "batch failed ({}); per-case fallback failed ({})",
                    reason, e
                ))),
            }
        }
        other => other,
    }
}

impl ExecutionService {
    /// Wire the engine on top of a sandbox provider
    pub fn new(
        config: Arc<LanguageConfigManager>,
        problems: Arc<dyn ProblemStore>,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<Self> {
        let runners = RunnerRegistry::from_config(&config)?;
        let mut pool = PoolManager::new(provider, config.clone());
        if config.effective_strategy(Language::Java).ok() == Some(BatchStrategy::PersistentWorker) {
            let java = config.get_config(Language::Java)?;
            pool = pool.with_hook(
                Language::Java,
                java_worker_hook(config.settings().java_worker_port, java.run_flags.clone()),
            );
        }
        let permits = Arc::new(Semaphore::new(config.settings().max_concurrent_submissions.max(1)));

        Ok(Self {
            config,
            problems,
            pool: Arc::new(pool),
            runners: Arc::new(runners),
            permits,
        })
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn config(&self) -> &Arc<LanguageConfigManager> {
        &self.config
    }

    /// Execute a submission against its problem's test cases
    ///
    /// ## Returns
    /// Always a `RunResponse`; failures are reported inside it, never raised
    #[tracing::instrument(
        skip(self, submission),
        fields(submission_id = %submission.id, language = %submission.language, problem_id = %submission.problem_id)
    )]
    pub async fn execute_test_cases(&self, submission: &Submission) -> RunResponse {
        let started = Instant::now();
        let response = match self.try_execute(submission).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    info!(error = %e, "Submission rejected");
                } else {
                    error!(error = %e, "Submission failed");
                }
                RunResponse::failure(submission.id, e.kind(), e.to_string())
            }
        };
        info!(
            passed = response.total_passed,
            failed = response.total_failed,
            success = response.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Submission finished"
        );
        response
    }

    /// Flat entry point for callers that do not build a `Submission` themselves
    pub async fn execute(
        &self,
        language: &str,
        source_code: &str,
        function_name: Option<&str>,
        problem_id: &str,
        tests: TestSelection,
        timeout_seconds: Option<u64>,
    ) -> RunResponse {
        let mut submission = Submission::new(language, source_code, problem_id);
        submission.function_name = function_name.map(str::to_string);
        submission.tests = tests;
        submission.timeout_seconds = timeout_seconds;
        self.execute_test_cases(&submission).await
    }

    async fn try_execute(&self, submission: &Submission) -> Result<RunResponse> {
        let language = self.config.resolve_language(&submission.language)?;

        if submission.source_code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(EngineError::InvalidSubmission(format!(
                "source code is {} bytes, limit is {}",
                submission.source_code.len(),
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if submission.source_code.trim().is_empty() {
            return Err(EngineError::InvalidSubmission("source code is empty".to_string()));
        }

        let problem = self.problems.load(&submission.problem_id)?;
        let signature: &Signature = problem.harness_signature(language)?;
        let function_name = submission
            .function_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(problem.function_name.as_str());
        let cases = select_cases(&problem, &submission.tests)?;
        let limit = self.config.execution_timeout(language, submission.timeout_seconds)?;
        let strategy = self.config.effective_strategy(language)?;
        let runner = self.runners.get(language)?;
        let worker_port = self.config.settings().java_worker_port;

        println!(
            "→ Executing {} submission {} ({} cases, {})",
            language,
            submission.id,
            cases.len(),
            strategy
        );

        let inputs: Vec<Map<String, Value>> = cases.iter().map(|c| c.input.clone()).collect();
        let job = BatchJob {
            user_code: &submission.source_code,
            function_name,
            signature,
            inputs: &inputs,
            limit,
        };

        let outcome = self
            .pool
            .with_retry(language, |lease| {
                let runner = runner.clone();
                async move { run_batch(runner.as_ref(), &lease, strategy, worker_port, &job).await }
            })
            .await?;

        if outcome.timed_out {
            // A killed run can leave the sandbox (or the worker) in a bad state
            self.pool.mark_for_health_check(language).await;
        }

        let compile_error = outcome.compile_error.clone();
        let timed_out = outcome.timed_out;
        let (test_results, total_passed, total_failed) =
            evaluate(&cases, outcome.results, problem.unordered_output);

        let (error, error_kind) = if let Some(diagnostic) = compile_error {
            (
                Some(format!("{}{}", COMPILE_FAILED_PREFIX, diagnostic.trim())),
                Some(ErrorKind::Compile),
            )
        } else if timed_out {
            (Some(TIMEOUT_ERROR.to_string()), Some(ErrorKind::Timeout))
        } else if let Some(first) = test_results.iter().find_map(|r| r.error.clone()) {
            (Some(first), Some(ErrorKind::Runtime))
        } else {
            (None, None)
        };

        Ok(RunResponse {
            submission_id: submission.id,
            success: error.is_none() && total_failed == 0,
            test_results,
            total_passed,
            total_failed,
            error,
            error_kind,
        })
    }

    /// Run a submission on its own task once a concurrency permit is free
    pub fn spawn(self: &Arc<Self>, submission: Submission) -> JoinHandle<RunResponse> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match service.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return RunResponse::failure(
                        submission.id,
                        ErrorKind::Infrastructure,
                        "execution service is shutting down",
                    )
                }
            };
            service.execute_test_cases(&submission).await
        })
    }

    /// `spawn` and wait; a panicked task still yields a structured response
    pub async fn submit(self: &Arc<Self>, submission: Submission) -> RunResponse {
        let id = submission.id;
        match self.spawn(submission).await {
            Ok(response) => response,
            Err(e) => {
                error!(submission_id = %id, error = %e, "Execution task aborted");
                RunResponse::failure(id, ErrorKind::Infrastructure, format!("execution task failed: {}", e))
            }
        }
    }

    /// Pull images, start pooled containers and prove each language end to end
    pub async fn warm_up(&self, languages: &[Language]) -> Vec<(Language, Result<()>)> {
        let mut report = Vec::with_capacity(languages.len());
        for (language, started) in self.pool.warm_up(languages).await {
            let result = match started {
                Ok(()) => self.smoke_test(language).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => info!(language = %language, "✓ Language ready"),
                Err(e) => warn!(language = %language, error = %e, "Language failed warm-up"),
            }
            report.push((language, result));
        }
        report
    }

    /// Run a trivial increment function through the normal path
    async fn smoke_test(&self, language: Language) -> Result<()> {
        let source = match language {
            Language::Python => "def cd_smoke(x):\n    return x + 1\n",
            Language::JavaScript => "function cd_smoke(x) {\n    return x + 1;\n}\n",
            Language::Java | Language::Cpp => "int cd_smoke(int x) {\n    return x + 1;\n}\n",
        };
        let signature = Signature {
            params: vec![Param {
                name: "x".to_string(),
                ty: ParamType::Int,
            }],
            returns: ParamType::Int,
            output_param: None,
        };
        let mut input = Map::new();
        input.insert("x".to_string(), Value::from(41));
        let inputs = vec![input];
        let job = BatchJob {
            user_code: source,
            function_name: "cd_smoke",
            signature: &signature,
            inputs: &inputs,
            limit: self.config.execution_timeout(language, None)?,
        };
        let runner = self.runners.get(language)?;
        let strategy = self.config.effective_strategy(language)?;
        let worker_port = self.config.settings().java_worker_port;

        let outcome = self
            .pool
            .with_retry(language, |lease| {
                let runner = runner.clone();
                async move { run_batch(runner.as_ref(), &lease, strategy, worker_port, &job).await }
            })
            .await?;
        match outcome.results.first() {
            Some(result) if result.success && result.output == Value::from(42) => Ok(()),
            Some(result) => Err(EngineError::Configuration(format!(
                "{} smoke run failed: {}",
                language,
                result.error.clone().unwrap_or_else(|| result.output.to_string())
            ))),
            None => Err(EngineError::Protocol(format!("{} smoke run printed nothing", language))),
        }
    }

    /// Destroy pooled containers; queued submissions are refused
    pub async fn shutdown(&self) {
        self.permits.close();
        self.pool.shutdown().await;
        info!("Execution service stopped");
    }
}
