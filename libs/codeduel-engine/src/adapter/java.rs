use super::{compile_with, run_with, Compilation, CompiledArtifact, Runner, ScratchDir};
use crate::config::LanguageConfig;
use crate::error::Result;
use crate::harness::java::{JavaHarness, HARNESS_CLASS};
use crate::harness::{HarnessGenerator, HarnessRequest};
use crate::sandbox::{ExecOutput, Sandbox};
use async_trait::async_trait;
use codeduel_common::types::Language;
use std::time::Duration;

/// JDK: `javac` into the scratch dir, `java -cp <dir> CdHarness`
///
/// Used for per-case and compile-once runs; pooled batches go through the
/// in-container worker instead (see `batch`).
pub struct JavaRunner {
    harness: JavaHarness,
    source_file: String,
    compile_flags: Vec<String>,
    run_flags: Vec<String>,
}

impl JavaRunner {
    pub fn new(config: &LanguageConfig) -> Result<Self> {
        Ok(Self {
            harness: JavaHarness::new()?,
            source_file: config.source_file.clone(),
            compile_flags: config.compile_flags.clone(),
            run_flags: config.run_flags.clone(),
        })
    }
}

#[async_trait]
impl Runner for JavaRunner {
    fn language(&self) -> Language {
        Language::Java
    }

    fn prepare_source(&self, request: &HarnessRequest<'_>) -> Result<String> {
        self.harness.generate(request)
    }

    #[tracing::instrument(skip_all, fields(language = "java"))]
    async fn compile(&self, sandbox: &dyn Sandbox, scratch: &ScratchDir, source: &str) -> Result<Compilation> {
        let mut cmd = vec!["javac".to_string()];
        cmd.extend(self.compile_flags.iter().cloned());
        cmd.extend([
            "-d".to_string(),
            scratch.path().to_string(),
            scratch.file(&self.source_file),
        ]);
        let classes = scratch.path().to_string();
        compile_with(sandbox, scratch, Language::Java, &self.source_file, source, cmd, classes).await
    }

    async fn run(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &CompiledArtifact,
        input: Option<&str>,
        limit: Duration,
    ) -> Result<ExecOutput> {
        let mut cmd = vec!["java".to_string()];
        cmd.extend(self.run_flags.iter().cloned());
        cmd.extend(["-cp".to_string(), artifact.path.clone(), HARNESS_CLASS.to_string()]);
        run_with(sandbox, artifact, cmd, input, limit).await
    }
}
