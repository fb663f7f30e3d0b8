use super::{compile_with, run_with, Compilation, CompiledArtifact, Runner, ScratchDir};
use crate::config::LanguageConfig;
use crate::error::Result;
use crate::harness::javascript::JavaScriptHarness;
use crate::harness::{HarnessGenerator, HarnessRequest};
use crate::sandbox::{ExecOutput, Sandbox};
use async_trait::async_trait;
use codeduel_common::types::Language;
use std::time::Duration;

/// Node.js: `node --check` catches syntax errors before any case runs
pub struct JavaScriptRunner {
    harness: JavaScriptHarness,
    source_file: String,
    run_flags: Vec<String>,
}

impl JavaScriptRunner {
    pub fn new(config: &LanguageConfig) -> Result<Self> {
        Ok(Self {
            harness: JavaScriptHarness::new()?,
            source_file: config.source_file.clone(),
            run_flags: config.run_flags.clone(),
        })
    }
}

#[async_trait]
impl Runner for JavaScriptRunner {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn prepare_source(&self, request: &HarnessRequest<'_>) -> Result<String> {
        self.harness.generate(request)
    }

    #[tracing::instrument(skip_all, fields(language = "javascript"))]
    async fn compile(&self, sandbox: &dyn Sandbox, scratch: &ScratchDir, source: &str) -> Result<Compilation> {
        let cmd = vec!["node".to_string(), "--check".to_string(), self.source_file.clone()];
        let path = scratch.file(&self.source_file);
        compile_with(sandbox, scratch, Language::JavaScript, &self.source_file, source, cmd, path).await
    }

    async fn run(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &CompiledArtifact,
        input: Option<&str>,
        limit: Duration,
    ) -> Result<ExecOutput> {
        let mut cmd = vec!["node".to_string()];
        cmd.extend(self.run_flags.iter().cloned());
        cmd.push(artifact.path.clone());
        run_with(sandbox, artifact, cmd, input, limit).await
    }
}
