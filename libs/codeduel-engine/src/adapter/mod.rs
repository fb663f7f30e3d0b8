/// Execution Adapters - One Runner per Guest Language
///
/// **Core Responsibility:**
/// Turn generated source into a result inside a leased sandbox:
/// 1. `prepare_source` - harness generation for this language
/// 2. `compile` - write into a submission-scoped scratch dir, compile or syntax-check
/// 3. `run` - execute with inputs as one JSON argv argument under a wall-clock limit
///
/// **Dispatch:**
/// Runners are looked up in a language → constructor table; a new language is a new
/// table entry plus one implementation, no central switch.
///
/// **Cleanup:**
/// `ScratchDir` removes its directory explicitly on the happy path and from `Drop`
/// on every other exit path (error, timeout, panic).
pub mod cpp;
pub mod java;
pub mod javascript;
pub mod python;

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::error::{EngineError, Result};
use crate::harness::HarnessRequest;
use crate::sandbox::{ExecOutput, ExecRequest, Sandbox};
use async_trait::async_trait;
use codeduel_common::types::Language;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound for compiling or syntax-checking one program
pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest single argv string the kernel accepts is 128 KiB; stay under it
pub const MAX_ARGV_INPUT_BYTES: usize = 120 * 1024;

/// A program ready to run
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub language: Language,
    /// Scratch directory the program runs in
    pub dir: String,
    /// Source file for interpreted languages, binary or class dir for compiled ones
    pub path: String,
    pub compile_time: Duration,
}

#[derive(Debug, Clone)]
pub enum Compilation {
    Ready(CompiledArtifact),
    /// Compiler or syntax-check diagnostic
    Failed(String),
}

/// Submission-scoped directory inside a (possibly shared) container
pub struct ScratchDir {
    sandbox: Arc<dyn Sandbox>,
    path: String,
    removed: bool,
}

impl ScratchDir {
    pub async fn create(sandbox: Arc<dyn Sandbox>) -> Result<Self> {
        let path = format!("/tmp/submission_{}", uuid::Uuid::new_v4().simple());
        let output = sandbox
            .exec(ExecRequest::system(["mkdir", "-p", path.as_str()], Duration::from_secs(10)))
            .await?;
        if !output.success() {
            return Err(EngineError::Sandbox(format!(
                "failed to create {}: {}",
                path,
                output.describe_exit()
            )));
        }
        Ok(Self {
            sandbox,
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }

    pub async fn cleanup(mut self) {
        self.removed = true;
        let request = ExecRequest::system(["rm", "-rf", self.path.as_str()], Duration::from_secs(10));
        if let Err(e) = self.sandbox.exec(request).await {
            warn!(path = %self.path, error = %e, "Failed to remove scratch directory");
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let sandbox = self.sandbox.clone();
        let path = std::mem::take(&mut self.path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let request = ExecRequest::system(["rm", "-rf", path.as_str()], Duration::from_secs(10));
                let _ = sandbox.exec(request).await;
            });
        }
    }
}

/// Per-language execution
#[async_trait]
pub trait Runner: Send + Sync {
    fn language(&self) -> Language;

    /// Generate complete program source for this language
    fn prepare_source(&self, request: &HarnessRequest<'_>) -> Result<String>;

    /// Write `source` into `scratch` and compile (or syntax-check) it
    async fn compile(&self, sandbox: &dyn Sandbox, scratch: &ScratchDir, source: &str) -> Result<Compilation>;

    /// Run a compiled program; `input` is the JSON array of case inputs, absent for embedded cases
    async fn run(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &CompiledArtifact,
        input: Option<&str>,
        limit: Duration,
    ) -> Result<ExecOutput>;
}

/// Write the source, run `cmd` as a guest command and classify the outcome
pub(crate) async fn compile_with(
    sandbox: &dyn Sandbox,
    scratch: &ScratchDir,
    language: Language,
    source_file: &str,
    source: &str,
    cmd: Vec<String>,
    artifact_path: String,
) -> Result<Compilation> {
    sandbox.write_file(&scratch.file(source_file), source).await?;

    let started = Instant::now();
    let output = sandbox
        .exec(ExecRequest::guest(cmd, COMPILE_TIMEOUT).in_dir(scratch.path()))
        .await?;
    let compile_time = started.elapsed();

    if output.timed_out {
        return Ok(Compilation::Failed(format!(
            "compilation timed out after {}s",
            COMPILE_TIMEOUT.as_secs()
        )));
    }
    if !output.success() {
        let mut diagnostic = output.stderr.trim().to_string();
        if diagnostic.is_empty() {
            diagnostic = output.stdout.trim().to_string();
        }
        if diagnostic.is_empty() {
            diagnostic = output.describe_exit();
        }
        debug!(language = %language, "Compilation failed");
        return Ok(Compilation::Failed(diagnostic));
    }

    debug!(language = %language, compile_ms = compile_time.as_millis() as u64, "Compiled");
    Ok(Compilation::Ready(CompiledArtifact {
        language,
        dir: scratch.path().to_string(),
        path: artifact_path,
        compile_time,
    }))
}

/// Append the argv input, refusing payloads the kernel would reject
/// Escape every non-ASCII character of a JSON document as `\uXXXX`
///
/// Guest runtimes decode argv with the container locale; ASCII survives any of them.
pub(crate) fn ascii_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

pub(crate) fn with_input(mut cmd: Vec<String>, input: Option<&str>) -> Result<Vec<String>> {
    if let Some(input) = input {
        let input = ascii_json(input);
        if input.len() > MAX_ARGV_INPUT_BYTES {
            return Err(EngineError::InvalidSubmission(format!(
                "test input is {} bytes, more than the {} byte limit",
                input.len(),
                MAX_ARGV_INPUT_BYTES
            )));
        }
        cmd.push(input);
    }
    Ok(cmd)
}

pub(crate) async fn run_with(
    sandbox: &dyn Sandbox,
    artifact: &CompiledArtifact,
    cmd: Vec<String>,
    input: Option<&str>,
    limit: Duration,
) -> Result<ExecOutput> {
    let cmd = with_input(cmd, input)?;
    sandbox
        .exec(ExecRequest::guest(cmd, limit).in_dir(artifact.dir.as_str()))
        .await
}

type RunnerFactory = fn(&LanguageConfig) -> Result<Arc<dyn Runner>>;

fn factories() -> HashMap<Language, RunnerFactory> {
    let mut table: HashMap<Language, RunnerFactory> = HashMap::new();
    table.insert(Language::Python, |c| Ok(Arc::new(python::PythonRunner::new(c)?) as Arc<dyn Runner>));
    table.insert(Language::JavaScript, |c| Ok(Arc::new(javascript::JavaScriptRunner::new(c)?) as Arc<dyn Runner>));
    table.insert(Language::Java, |c| Ok(Arc::new(java::JavaRunner::new(c)?) as Arc<dyn Runner>));
    table.insert(Language::Cpp, |c| Ok(Arc::new(cpp::CppRunner::new(c)?) as Arc<dyn Runner>));
    table
}

/// Runners for every configured language
pub struct RunnerRegistry {
    runners: HashMap<Language, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn from_config(config: &LanguageConfigManager) -> Result<Self> {
        let table = factories();
        let mut runners = HashMap::new();
        for language in config.list_languages() {
            let factory = table.get(&language).ok_or_else(|| {
                EngineError::Configuration(format!("No runner implementation for {}", language))
            })?;
            runners.insert(language, factory(config.get_config(language)?)?);
        }
        Ok(Self { runners })
    }

    pub fn get(&self, language: Language) -> Result<Arc<dyn Runner>> {
        self.runners
            .get(&language)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Param, ParamType, Signature};
    use crate::harness::CaseSource;
    use crate::testing::{failed, ok, FakeSandbox, FakeScript};

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

    #[tokio::test]
    async fn test_registry_covers_every_builtin_language() {
        let registry = RunnerRegistry::from_config(&LanguageConfigManager::builtin()).unwrap();
        for language in Language::ALL {
            assert_eq!(registry.get(language).unwrap().language(), language);
        }
    }

    #[tokio::test]
    async fn test_scratch_dir_cleanup_on_drop() {
        let sandbox = Arc::new(FakeSandbox::new("c1", FakeScript::ok()));
        let scratch = ScratchDir::create(sandbox.clone()).await.unwrap();
        let path = scratch.path().to_string();
        sandbox.write_file(&scratch.file("main.py"), "x = 1").await.unwrap();
        assert_eq!(sandbox.paths().len(), 1);

        drop(scratch);
        tokio::task::yield_now().await;
        assert!(sandbox.paths().is_empty());
        assert!(sandbox
            .commands()
            .iter()
            .any(|c| c.first().map(String::as_str) == Some("rm") && c.contains(&path)));
    }

    #[tokio::test]
    async fn test_compile_failure_carries_diagnostic() {
        let script = FakeScript::new(|cmd, _| {
            if cmd.iter().any(|a| a == "py_compile") {
                failed(1, "  File \"main.py\", line 1\n    def broken(:\nSyntaxError: invalid syntax")
            } else {
                ok("")
            }
        });
        let sandbox = Arc::new(FakeSandbox::new("c1", script));
        let registry = RunnerRegistry::from_config(&LanguageConfigManager::builtin()).unwrap();
        let runner = registry.get(Language::Python).unwrap();
        let sig = signature();
        let source = runner
            .prepare_source(&HarnessRequest {
                user_code: "def broken(:\n    pass\n",
                function_name: "broken",
                signature: &sig,
                cases: CaseSource::Argv,
            })
            .unwrap();

        let scratch = ScratchDir::create(sandbox.clone()).await.unwrap();
        match runner.compile(sandbox.as_ref(), &scratch, &source).await.unwrap() {
            Compilation::Failed(diagnostic) => assert!(diagnostic.contains("SyntaxError")),
            Compilation::Ready(_) => panic!("expected a compile failure"),
        }
        scratch.cleanup().await;
        assert!(sandbox.paths().is_empty());
    }

    #[test]
    fn test_argv_input_is_ascii() {
        let raw = serde_json::to_string(&serde_json::json!([{"s": "é😀"}])).unwrap();
        let cmd = with_input(vec!["prog".to_string()], Some(&raw)).unwrap();
        assert_eq!(cmd[1], r#"[{"s":"\u00e9\ud83d\ude00"}]"#);
        let decoded: serde_json::Value = serde_json::from_str(&cmd[1]).unwrap();
        assert_eq!(decoded[0]["s"], "é😀");
    }

    #[test]
    fn test_oversized_input_is_rejected() {
        let big = "1".repeat(MAX_ARGV_INPUT_BYTES + 1);
        let result = with_input(vec!["prog".to_string()], Some(&big));
        assert!(matches!(result, Err(EngineError::InvalidSubmission(_))));
        assert_eq!(with_input(vec!["prog".to_string()], None).unwrap(), vec!["prog"]);
    }
}
