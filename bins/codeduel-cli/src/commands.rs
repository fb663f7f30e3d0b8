// CLI commands for running and operating the CodeDuel engine
use anyhow::{bail, Context, Result};
use codeduel_common::config::RuntimeSettings;
use codeduel_common::redis;
use codeduel_common::types::{Submission, SubmissionJob, TestSelection};
use codeduel_engine::harness::{generator_for, CaseSource, HarnessRequest};
use codeduel_engine::registry::{FsProblemStore, ProblemStore};
use codeduel_engine::sandbox::DockerProvider;
use codeduel_engine::{ExecutionService, LanguageConfigManager};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn read_source(file: &str) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Failed to read solution file {}", file))
}

fn build_service(settings: &RuntimeSettings) -> Result<Arc<ExecutionService>> {
    let config = LanguageConfigManager::load_default().context("Failed to load language configuration")?;
    let provider = Arc::new(DockerProvider::connect().context("Failed to connect to Docker")?);
    let problems = Arc::new(FsProblemStore::new(settings.problems_dir.clone()));
    Ok(Arc::new(ExecutionService::new(Arc::new(config), problems, provider)?))
}

/// Run a solution file through the full engine
pub async fn run_solution(
    problem: &str,
    language: &str,
    file: &str,
    function: Option<&str>,
    sample: Option<usize>,
    timeout: Option<u64>,
) -> Result<()> {
    let settings = RuntimeSettings::from_env();
    let source = read_source(file)?;
    let service = build_service(&settings)?;

    let tests = match sample {
        Some(count) => TestSelection::Sample { count },
        None => TestSelection::All,
    };
    eprintln!("🚀 Running {} against {}...", file, problem);
    let response = service
        .execute(language, &source, function, problem, tests, timeout)
        .await;
    service.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if response.success {
        eprintln!("✅ {} / {} passed", response.total_passed, response.test_results.len());
    } else {
        eprintln!(
            "❌ {} passed, {} failed{}",
            response.total_passed,
            response.total_failed,
            response.error.map(|e| format!(": {}", e)).unwrap_or_default()
        );
    }
    Ok(())
}

/// Generated program for `code`, without touching Docker
pub fn render_harness(problems_dir: &Path, problem_id: &str, language: &str, code: &str, embed: bool) -> Result<String> {
    let config = LanguageConfigManager::load_default()?;
    let language = config.resolve_language(language)?;
    let problem = FsProblemStore::new(problems_dir).load(problem_id)?;
    let signature = problem.harness_signature(language)?;

    let inputs: Vec<Map<String, Value>> = problem.tests.iter().map(|t| t.input.clone()).collect();
    let cases = if embed {
        CaseSource::Embedded(&inputs)
    } else {
        CaseSource::Argv
    };
    let generator = generator_for(language)?;
    let source = generator.generate(&HarnessRequest {
        user_code: code,
        function_name: &problem.function_name,
        signature,
        cases,
    })?;
    Ok(source)
}

pub fn print_harness(problem: &str, language: &str, file: &str, embed: bool) -> Result<()> {
    let settings = RuntimeSettings::from_env();
    let source = read_source(file)?;
    println!("{}", render_harness(&settings.problems_dir, problem, language, &source, embed)?);
    Ok(())
}

/// Pull images, start containers and run a smoke submission per language
pub async fn warm_up(languages: &[String], keep: bool) -> Result<()> {
    let settings = RuntimeSettings::from_env();
    let service = build_service(&settings)?;

    let selected = if languages.is_empty() {
        service.config().list_languages()
    } else {
        languages
            .iter()
            .map(|l| service.config().resolve_language(l))
            .collect::<codeduel_engine::Result<Vec<_>>>()?
    };

    println!("🔥 Warming up: {:?}", selected);
    let mut failures = 0;
    for (language, result) in service.warm_up(&selected).await {
        match result {
            Ok(()) => println!("  ✅ {}", language),
            Err(e) => {
                failures += 1;
                println!("  ❌ {}: {}", language, e);
            }
        }
    }

    if keep {
        println!("\n📦 Containers left running:");
        for status in service.pool().status().await {
            println!(
                "  {:<12} {:<10} {}",
                status.language,
                status.state.to_string(),
                status.container_id.unwrap_or_default()
            );
        }
    } else {
        service.shutdown().await;
    }

    if failures > 0 {
        bail!("{} language(s) failed warm-up", failures);
    }
    Ok(())
}

/// Remove all managed containers, including ones left by crashed workers
pub async fn teardown() -> Result<()> {
    let settings = RuntimeSettings::from_env();
    let service = build_service(&settings)?;
    let removed = service.pool().teardown_managed().await?;
    println!("🗑️  Removed {} container(s)", removed);
    Ok(())
}

pub fn list_languages() -> Result<()> {
    let config = LanguageConfigManager::load_default()?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<12} {:<14} {:<24} {:<20} {:<10}",
        "Name", "Aliases", "Image", "Strategy", "CPU/Mem"
    );
    println!("{}", "─".repeat(90));

    let languages = config.list_languages();
    for language in &languages {
        let lang = config.get_config(*language)?;
        println!(
            "{:<12} {:<14} {:<24} {:<20} {:.1}/{}",
            lang.name.to_string(),
            lang.aliases.join(","),
            lang.image,
            config.effective_strategy(*language)?.to_string(),
            lang.cpu_limit,
            lang.memory_limit
        );
    }

    println!("\n✅ Total: {} language(s)", languages.len());
    Ok(())
}

/// Queue a submission for the worker, optionally waiting for its result
pub async fn enqueue(
    problem: &str,
    language: &str,
    file: &str,
    function: Option<&str>,
    wait: Option<u64>,
) -> Result<()> {
    let settings = RuntimeSettings::from_env();
    let source = read_source(file)?;

    let mut submission = Submission::new(language, &source, problem);
    submission.function_name = function.map(str::to_string);
    let id = submission.id;

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let mut conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    redis::push_submission(&mut conn, &SubmissionJob::new(submission)).await?;
    println!("📨 Enqueued submission {}", id);

    let Some(wait) = wait else {
        return Ok(());
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    while tokio::time::Instant::now() < deadline {
        if let Some(response) = redis::get_result(&mut conn, &id).await? {
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    bail!("No result for {} after {}s", id, wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problems_dir() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data/problems")
    }

    #[test]
    fn test_render_python_harness() {
        let code = "def twoSum(nums, target):\n    return [0, 1]\n";
        let source = render_harness(&problems_dir(), "two-sum", "py", code, false).unwrap();
        assert!(source.contains("def twoSum(nums, target):"));
        assert!(source.contains("\"target\""));
    }

    #[test]
    fn test_render_embeds_cases() {
        let code = "int missingNumber(vector<int>& nums) { return 0; }";
        let source = render_harness(&problems_dir(), "missing-number", "cpp", code, true).unwrap();
        assert!(source.contains("int missingNumber(vector<int>& nums)"));
        assert!(source.contains("\\\"nums\\\""));
    }

    #[test]
    fn test_render_unknown_language() {
        let result = render_harness(&problems_dir(), "two-sum", "cobol", "", false);
        assert!(result.is_err());
    }
}
