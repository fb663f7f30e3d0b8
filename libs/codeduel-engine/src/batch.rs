/// Batch Execution Protocol
///
/// **Strategies:**
/// - Per-case: compile once, one process per test case, inputs as one argv JSON array
/// - Compile-once: all inputs embedded in one program, one compile, one run
/// - Persistent worker: a long-lived JVM in the pooled container compiles and runs the
///   batch, talking one JSON request line / one JSON array reply over loopback
///
/// **Ordering:**
/// Every strategy returns exactly one `GuestResult` per case, `results[i]` for `cases[i]`.
///
/// **Failure Split:**
/// - User-visible outcomes (compile error, crash, timeout) are results, never errors
/// - Transport or format corruption is `EngineError::Protocol`; the caller re-runs per case
/// - A broken sandbox is `EngineError::Sandbox`; the pool recreates and retries once
use crate::adapter::{Compilation, Runner, ScratchDir};
use crate::error::{EngineError, Result};
use crate::evaluator::{
    compile_failure, missing_result, pad_results, parse_result_lines, GuestResult, COMPILE_FAILED_PREFIX, TIMEOUT_ERROR,
};
use crate::harness::java::{CDJSON_SOURCE, WORKER_SOURCE};
use crate::harness::{CaseSource, HarnessRequest};
use crate::pool::{ContainerHook, ContainerLease};
use crate::registry::Signature;
use crate::sandbox::{ExecOutput, ExecRequest, Sandbox};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WORKER_HOME: &str = "/opt/codeduel";
const WORKER_LEASE_TIMEOUT: Duration = Duration::from_secs(120);
const WORKER_GRACE: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(3);
const STARTUP_POLLS: u32 = 30;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What one submission's code and cases look like to the batch layer
#[derive(Debug, Clone, Copy)]
pub struct BatchJob<'a> {
    pub user_code: &'a str,
    pub function_name: &'a str,
    pub signature: &'a Signature,
    pub inputs: &'a [Map<String, Value>],
    /// Wall-clock limit per run
    pub limit: Duration,
}

impl<'a> BatchJob<'a> {
    fn harness(&self, cases: CaseSource<'a>) -> HarnessRequest<'a> {
        HarnessRequest {
            user_code: self.user_code,
            function_name: self.function_name,
            signature: self.signature,
            cases,
        }
    }
}

/// Results for one batch, aligned with the job's inputs
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<GuestResult>,
    /// Set when the code never compiled; every result carries the diagnostic
    pub compile_error: Option<String>,
    pub timed_out: bool,
}

impl BatchOutcome {
    fn new(results: Vec<GuestResult>) -> Self {
        let timed_out = results
            .iter()
            .any(|r| r.error.as_deref() == Some(TIMEOUT_ERROR));
        Self {
            results,
            compile_error: None,
            timed_out,
        }
    }

    fn compile_failed(job: &BatchJob<'_>, diagnostic: String) -> Self {
        Self {
            results: compile_failure(job.inputs.len(), &diagnostic),
            compile_error: Some(diagnostic),
            timed_out: false,
        }
    }
}

/// Why a run produced no result line
fn silent_failure(output: &ExecOutput) -> String {
    if output.timed_out {
        return TIMEOUT_ERROR.to_string();
    }
    missing_result(&output.describe_exit())
}

/// One process per test case
#[tracing::instrument(skip_all, fields(language = %runner.language(), cases = job.inputs.len()))]
pub async fn run_per_case(runner: &dyn Runner, lease: &ContainerLease, job: &BatchJob<'_>) -> Result<BatchOutcome> {
    let source = runner.prepare_source(&job.harness(CaseSource::Argv))?;
    let scratch = ScratchDir::create(lease.sandbox.clone()).await?;
    let sandbox = lease.sandbox.as_ref();

    let artifact = match runner.compile(sandbox, &scratch, &source).await? {
        Compilation::Ready(artifact) => artifact,
        Compilation::Failed(diagnostic) => {
            scratch.cleanup().await;
            return Ok(BatchOutcome::compile_failed(job, diagnostic));
        }
    };

    let mut results = Vec::with_capacity(job.inputs.len());
    for input in job.inputs {
        let payload = serde_json::to_string(&[input])?;
        let result = match runner.run(sandbox, &artifact, Some(&payload), job.limit).await {
            Ok(output) => match parse_result_lines(&output.stdout).into_iter().next() {
                Some(result) if !output.timed_out => result,
                _ => GuestResult::failure(silent_failure(&output)),
            },
            Err(EngineError::InvalidSubmission(reason)) => GuestResult::failure(reason),
            Err(e) => return Err(e),
        };
        results.push(result);
    }

    scratch.cleanup().await;
    Ok(BatchOutcome::new(results))
}

/// Every input compiled into one program, one run
#[tracing::instrument(skip_all, fields(language = %runner.language(), cases = job.inputs.len()))]
pub async fn run_compile_once(runner: &dyn Runner, lease: &ContainerLease, job: &BatchJob<'_>) -> Result<BatchOutcome> {
    let source = runner.prepare_source(&job.harness(CaseSource::Embedded(job.inputs)))?;
    let scratch = ScratchDir::create(lease.sandbox.clone()).await?;
    let sandbox = lease.sandbox.as_ref();

    let artifact = match runner.compile(sandbox, &scratch, &source).await? {
        Compilation::Ready(artifact) => artifact,
        Compilation::Failed(diagnostic) => {
            scratch.cleanup().await;
            return Ok(BatchOutcome::compile_failed(job, diagnostic));
        }
    };

    let output = runner.run(sandbox, &artifact, None, job.limit).await?;
    scratch.cleanup().await;

    let expected = job.inputs.len();
    let parsed = parse_result_lines(&output.stdout);
    if output.timed_out || !output.success() {
        // Cases before the crash keep their verdicts
        let results = pad_results(parsed, expected, &silent_failure(&output));
        return Ok(BatchOutcome::new(results));
    }
    if parsed.len() != expected {
        return Err(EngineError::Protocol(format!(
            "batch printed {} result lines for {} cases",
            parsed.len(),
            expected
        )));
    }
    Ok(BatchOutcome::new(parsed))
}

/// Loopback round trip to the in-container worker: send one line, read until close
fn socket_exchange(port: u16, request_file: &str, limit: Duration) -> ExecRequest {
    ExecRequest::guest(
        [
            "bash".to_string(),
            "-c".to_string(),
            "exec 3<>/dev/tcp/127.0.0.1/\"$1\" && cat \"$2\" >&3 && cat <&3".to_string(),
            "_".to_string(),
            port.to_string(),
            request_file.to_string(),
        ],
        limit,
    )
}

fn ping(port: u16) -> ExecRequest {
    ExecRequest::guest(
        [
            "bash".to_string(),
            "-c".to_string(),
            "exec 3<>/dev/tcp/127.0.0.1/\"$1\" && echo PING >&3 && head -n 1 <&3".to_string(),
            "_".to_string(),
            port.to_string(),
        ],
        PING_TIMEOUT,
    )
}

/// Decode the worker's reply: a JSON array of exactly `expected` result objects
pub fn parse_worker_reply(stdout: &str, expected: usize) -> Result<Vec<GuestResult>> {
    let reply: Vec<Value> = serde_json::from_str(stdout.trim())
        .map_err(|e| EngineError::Protocol(format!("malformed worker reply: {}", e)))?;
    if reply.len() != expected {
        return Err(EngineError::Protocol(format!(
            "worker returned {} results for {} cases",
            reply.len(),
            expected
        )));
    }
    reply
        .iter()
        .map(|value| {
            GuestResult::from_value(value)
                .ok_or_else(|| EngineError::Protocol(format!("invalid worker result: {}", value)))
        })
        .collect()
}

/// Batch through the persistent worker; programs run one at a time per container
#[tracing::instrument(skip_all, fields(cases = job.inputs.len(), generation = lease.generation))]
pub async fn run_persistent_worker(
    runner: &dyn Runner,
    lease: &ContainerLease,
    port: u16,
    job: &BatchJob<'_>,
) -> Result<BatchOutcome> {
    let source = runner.prepare_source(&job.harness(CaseSource::Argv))?;
    let test_cases: Vec<Value> = job.inputs.iter().map(|input| json!({ "input": input })).collect();
    let request = json!({
        "code": source,
        "test_cases": test_cases,
        "function_name": job.function_name,
        "timeout_ms": job.limit.as_millis() as u64,
    });
    let mut frame = serde_json::to_string(&request)?;
    frame.push('\n');

    let _serialized = tokio::time::timeout(WORKER_LEASE_TIMEOUT, lease.worker_lease.lock())
        .await
        .map_err(|_| EngineError::Protocol("timed out waiting for the worker lease".to_string()))?;

    let scratch = ScratchDir::create(lease.sandbox.clone()).await?;
    let request_file = scratch.file("request.json");
    lease.sandbox.write_file(&request_file, &frame).await?;

    // Worst case every case runs to its limit, plus javac
    let budget = job.limit * job.inputs.len().max(1) as u32 + WORKER_GRACE;
    let output = lease
        .sandbox
        .exec(socket_exchange(port, &request_file, budget))
        .await?;
    scratch.cleanup().await;

    if output.timed_out {
        return Err(EngineError::Protocol(format!(
            "worker did not answer within {}s",
            budget.as_secs()
        )));
    }
    if !output.success() {
        return Err(EngineError::Protocol(format!(
            "worker unreachable: {}",
            output.describe_exit()
        )));
    }

    let results = parse_worker_reply(&output.stdout, job.inputs.len())?;
    let compile_error = results
        .iter()
        .map(|r| r.error.as_deref().and_then(|e| e.strip_prefix(COMPILE_FAILED_PREFIX)))
        .collect::<Option<Vec<_>>>()
        .and_then(|errors| errors.first().map(|e| e.to_string()));

    let mut outcome = BatchOutcome::new(results);
    outcome.compile_error = compile_error;
    debug!(timed_out = outcome.timed_out, "Worker batch finished");
    Ok(outcome)
}

/// Starts and probes the JVM worker in every fresh Java container
pub struct JavaWorkerHook {
    port: u16,
    run_flags: Vec<String>,
}

impl JavaWorkerHook {
    pub fn new(port: u16, run_flags: Vec<String>) -> Self {
        Self { port, run_flags }
    }

    async fn answers_ping(&self, sandbox: &dyn Sandbox) -> Result<bool> {
        let output = sandbox.exec(ping(self.port)).await?;
        Ok(output.success() && output.stdout.trim() == "PONG")
    }
}

#[async_trait]
impl ContainerHook for JavaWorkerHook {
    #[tracing::instrument(skip_all, fields(port = self.port))]
    async fn bootstrap(&self, sandbox: &dyn Sandbox) -> Result<()> {
        let mkdir = sandbox
            .exec(ExecRequest::system(["mkdir", "-p", WORKER_HOME], Duration::from_secs(10)))
            .await?;
        if !mkdir.success() {
            return Err(EngineError::Sandbox(format!("mkdir {}: {}", WORKER_HOME, mkdir.describe_exit())));
        }
        let cdjson = format!("{}/CdJson.java", WORKER_HOME);
        let worker = format!("{}/CdWorker.java", WORKER_HOME);
        sandbox.write_file(&cdjson, CDJSON_SOURCE).await?;
        sandbox.write_file(&worker, WORKER_SOURCE).await?;

        let javac = sandbox
            .exec(ExecRequest::system(
                [
                    "javac", "-nowarn", "-encoding", "UTF-8", "-d", WORKER_HOME, cdjson.as_str(), worker.as_str(),
                ],
                Duration::from_secs(120),
            ))
            .await?;
        if !javac.success() {
            return Err(EngineError::Configuration(format!(
                "worker sources failed to compile: {}",
                javac.stderr.trim()
            )));
        }

        let mut start = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "p=$1; shift; nohup java \"$@\" -cp {} CdWorker \"$p\" > /tmp/cdworker.log 2>&1 &",
                WORKER_HOME
            ),
            "_".to_string(),
            self.port.to_string(),
        ];
        start.extend(self.run_flags.iter().cloned());
        let started = sandbox.exec(ExecRequest::system(start, Duration::from_secs(10))).await?;
        if !started.success() {
            return Err(EngineError::Sandbox(format!("worker launch failed: {}", started.describe_exit())));
        }

        for _ in 0..STARTUP_POLLS {
            if self.answers_ping(sandbox).await.unwrap_or(false) {
                info!(port = self.port, "✓ Java worker listening");
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
        warn!(port = self.port, "Java worker never answered PING");
        Err(EngineError::Sandbox("java worker did not start".to_string()))
    }

    async fn probe(&self, sandbox: &dyn Sandbox) -> Result<bool> {
        self.answers_ping(sandbox).await
    }
}

/// Shared handle type for registering the hook with the pool
pub fn java_worker_hook(port: u16, run_flags: Vec<String>) -> Arc<dyn ContainerHook> {
    Arc::new(JavaWorkerHook::new(port, run_flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RunnerRegistry;
    use crate::config::LanguageConfigManager;
    use crate::pool::PoolManager;
    use crate::registry::{Param, ParamType};
    use crate::sandbox::SandboxProvider;
    use crate::testing::{failed, ok, FakeProvider, FakeScript};
    use codeduel_common::types::Language;
    use serde_json::json;

    fn signature() -> Signature {
        Signature {
            params: vec![Param {
                name: "nums".to_string(),
                ty: ParamType::IntArray,
            }],
            returns: ParamType::Int,
            output_param: None,
        }
    }

    fn inputs(n: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| {
                let mut input = Map::new();
                input.insert("nums".to_string(), json!([i]));
                input
            })
            .collect()
    }

    fn line(output: Value) -> String {
        format!(
            "{}\n",
            json!({"success": true, "output": output, "error": null, "execution_time": 0.1})
        )
    }

    async fn lease(script: FakeScript, language: Language) -> (ContainerLease, Arc<dyn Runner>) {
        let provider = Arc::new(FakeProvider::new(script));
        let config = Arc::new(LanguageConfigManager::builtin());
        let runners = RunnerRegistry::from_config(&config).unwrap();
        let pool = PoolManager::new(provider, config);
        (pool.acquire(language).await.unwrap(), runners.get(language).unwrap())
    }

    #[test]
    fn test_worker_reply_must_match_case_count() {
        let reply = format!("[{},{}]", line(json!(2)).trim(), line(json!(8)).trim());
        assert_eq!(parse_worker_reply(&reply, 2).unwrap()[1].output, json!(8));
        assert!(matches!(parse_worker_reply(&reply, 3), Err(EngineError::Protocol(_))));
        assert!(matches!(parse_worker_reply("PONG", 1), Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_per_case_runs_each_input() {
        let script = FakeScript::new(|cmd, _| match cmd.first().map(String::as_str) {
            Some("python3") if cmd.len() > 3 && cmd[1] == "-u" => {
                let input: Vec<Map<String, Value>> = serde_json::from_str(cmd.last().unwrap()).unwrap();
                ok(&line(input[0]["nums"][0].clone()))
            }
            _ => ok(""),
        });
        let (lease, runner) = lease(script, Language::Python).await;
        let sig = signature();
        let cases = inputs(3);
        let job = BatchJob {
            user_code: "def f(nums):\n    return nums[0]\n",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let outcome = run_per_case(runner.as_ref(), &lease, &job).await.unwrap();
        let outputs: Vec<Value> = outcome.results.iter().map(|r| r.output.clone()).collect();
        assert_eq!(outputs, vec![json!(0), json!(1), json!(2)]);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_compile_once_crash_pads_remaining_cases() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.first().map(|c| c.ends_with("/prog")).unwrap_or(false) {
                let mut output = failed(139, "");
                output.stdout = line(json!(1));
                output
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Cpp).await;
        let sig = signature();
        let cases = inputs(3);
        let job = BatchJob {
            user_code: "int f(vector<int>& nums) { return nums[0]; }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let outcome = run_compile_once(runner.as_ref(), &lease, &job).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results[0].success);
        let error = outcome.results[2].error.clone().unwrap();
        assert!(error.contains("segmentation fault"), "{}", error);
    }

    #[tokio::test]
    async fn test_compile_once_short_clean_output_is_protocol_error() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.first().map(|c| c.ends_with("/prog")).unwrap_or(false) {
                ok(&line(json!(1)))
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Cpp).await;
        let sig = signature();
        let cases = inputs(2);
        let job = BatchJob {
            user_code: "int f(vector<int>& nums) { return nums[0]; }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let result = run_compile_once(runner.as_ref(), &lease, &job).await;
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_compile_once_timeout_marks_cases() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.first().map(|c| c.ends_with("/prog")).unwrap_or(false) {
                ExecOutput {
                    timed_out: true,
                    ..Default::default()
                }
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Cpp).await;
        let sig = signature();
        let cases = inputs(2);
        let job = BatchJob {
            user_code: "int f(vector<int>& nums) { while (true) {} }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(1),
        };
        let outcome = run_compile_once(runner.as_ref(), &lease, &job).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.results.iter().all(|r| r.error.as_deref() == Some("timeout")));
    }

    #[tokio::test]
    async fn test_persistent_worker_round_trip() {
        let script = FakeScript::new(|cmd, files| {
            if cmd.first().map(String::as_str) == Some("bash") && cmd[2].contains("cat \"$2\"") {
                let frame = files.get(&cmd[5]).cloned().unwrap_or_default();
                let request: Value = serde_json::from_str(frame.trim()).unwrap();
                assert_eq!(request["function_name"], json!("f"));
                assert!(request["code"].as_str().unwrap().contains("class CdHarness"));
                let lines: Vec<String> = request["test_cases"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|c| line(c["input"]["nums"][0].clone()).trim().to_string())
                    .collect();
                ok(&format!("[{}]\n", lines.join(",")))
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Java).await;
        let sig = signature();
        let cases = inputs(3);
        let job = BatchJob {
            user_code: "int f(int[] nums) { return nums[0]; }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let outcome = run_persistent_worker(runner.as_ref(), &lease, 8899, &job).await.unwrap();
        let outputs: Vec<Value> = outcome.results.iter().map(|r| r.output.clone()).collect();
        assert_eq!(outputs, vec![json!(0), json!(1), json!(2)]);
        assert!(outcome.compile_error.is_none());
    }

    #[tokio::test]
    async fn test_persistent_worker_compile_error() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.first().map(String::as_str) == Some("bash") {
                let failure = json!({
                    "success": false, "output": null,
                    "error": "Compilation failed: CdHarness.java:7: error: ';' expected",
                    "execution_time": null
                });
                ok(&format!("[{},{}]\n", failure, failure))
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Java).await;
        let sig = signature();
        let cases = inputs(2);
        let job = BatchJob {
            user_code: "int f(int[] nums) { return nums[0] }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let outcome = run_persistent_worker(runner.as_ref(), &lease, 8899, &job).await.unwrap();
        assert_eq!(
            outcome.compile_error.as_deref(),
            Some("CdHarness.java:7: error: ';' expected")
        );
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_protocol_error() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.first().map(String::as_str) == Some("bash") {
                failed(1, "bash: connect: Connection refused")
            } else {
                ok("")
            }
        });
        let (lease, runner) = lease(script, Language::Java).await;
        let sig = signature();
        let cases = inputs(1);
        let job = BatchJob {
            user_code: "int f(int[] nums) { return 0; }",
            function_name: "f",
            signature: &sig,
            inputs: &cases,
            limit: Duration::from_secs(2),
        };
        let result = run_persistent_worker(runner.as_ref(), &lease, 8899, &job).await;
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_hook_bootstrap_waits_for_pong() {
        let script = FakeScript::new(|cmd, files| {
            if cmd.first().map(String::as_str) == Some("bash") && cmd[2].contains("PING") {
                if files.contains_key("/opt/codeduel/CdWorker.java") {
                    return ok("PONG\n");
                }
                return failed(1, "refused");
            }
            ok("")
        });
        let provider = FakeProvider::new(script);
        let sandbox = provider
            .create(&crate::sandbox::SandboxSpec {
                name: "codeduel-java-runner".to_string(),
                image: "openjdk:11-jdk-slim".to_string(),
                memory_bytes: 512 << 20,
                nano_cpus: 1_000_000_000,
                pids_limit: 128,
                labels: Default::default(),
            })
            .await
            .unwrap();
        let hook = JavaWorkerHook::new(8899, vec!["-XX:+UseSerialGC".to_string()]);
        hook.bootstrap(sandbox.as_ref()).await.unwrap();
        assert!(hook.probe(sandbox.as_ref()).await.unwrap());

        let fake = provider.sandbox("codeduel-java-runner").unwrap();
        assert!(fake.file("/opt/codeduel/CdJson.java").unwrap().contains("final class CdJson"));
        let launch = fake
            .commands()
            .into_iter()
            .find(|c| c.len() > 2 && c[2].contains("nohup java"))
            .unwrap();
        assert_eq!(&launch[4..], &["8899".to_string(), "-XX:+UseSerialGC".to_string()]);
    }
}
