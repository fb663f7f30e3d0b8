use super::{compile_with, run_with, Compilation, CompiledArtifact, Runner, ScratchDir};
use crate::config::LanguageConfig;
use crate::error::Result;
use crate::harness::cpp::CppHarness;
use crate::harness::{HarnessGenerator, HarnessRequest};
use crate::sandbox::{ExecOutput, Sandbox};
use async_trait::async_trait;
use codeduel_common::types::Language;
use std::time::Duration;

const BINARY: &str = "prog";

/// g++: one native binary per submission
pub struct CppRunner {
    harness: CppHarness,
    source_file: String,
    compile_flags: Vec<String>,
}

impl CppRunner {
    pub fn new(config: &LanguageConfig) -> Result<Self> {
        Ok(Self {
            harness: CppHarness::new()?,
            source_file: config.source_file.clone(),
            compile_flags: config.compile_flags.clone(),
        })
    }
}

#[async_trait]
impl Runner for CppRunner {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn prepare_source(&self, request: &HarnessRequest<'_>) -> Result<String> {
        self.harness.generate(request)
    }

    #[tracing::instrument(skip_all, fields(language = "cpp"))]
    async fn compile(&self, sandbox: &dyn Sandbox, scratch: &ScratchDir, source: &str) -> Result<Compilation> {
        let binary = scratch.file(BINARY);
        let mut cmd = vec!["g++".to_string()];
        cmd.extend(self.compile_flags.iter().cloned());
        cmd.extend(["-o".to_string(), binary.clone(), scratch.file(&self.source_file)]);
        compile_with(sandbox, scratch, Language::Cpp, &self.source_file, source, cmd, binary).await
    }

    async fn run(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &CompiledArtifact,
        input: Option<&str>,
        limit: Duration,
    ) -> Result<ExecOutput> {
        run_with(sandbox, artifact, vec![artifact.path.clone()], input, limit).await
    }
}
