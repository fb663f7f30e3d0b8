// Language and engine configuration for the execution engine
use crate::error::{EngineError, Result};
use codeduel_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How a language amortizes startup/compile cost across test cases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One process per test case
    PerCase,
    /// All inputs embedded into one program, compiled and run once
    CompileOnce,
    /// Long-lived in-container process serving batches over loopback
    PersistentWorker,
}

impl std::fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStrategy::PerCase => write!(f, "per_case"),
            BatchStrategy::CompileOnce => write!(f, "compile_once"),
            BatchStrategy::PersistentWorker => write!(f, "persistent_worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    /// Extra spellings accepted from callers (`py`, `js`, `c++`, ...)
    #[serde(default)]
    pub aliases: Vec<String>,
    pub image: String,
    /// Prefix of the `<PREFIX>_MEMORY_LIMIT` style overrides
    pub env_prefix: String,
    /// File name of the generated program inside the scratch dir
    pub source_file: String,
    /// Docker-style size, e.g. `256m`
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub timeout_seconds: u64,
    pub batch_strategy: BatchStrategy,
    #[serde(default)]
    pub compile_flags: Vec<String>,
    #[serde(default)]
    pub run_flags: Vec<String>,
}

impl LanguageConfig {
    /// Memory limit in bytes, or None when the configured value does not parse
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory_limit)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Engine-wide knobs, all environment driven
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub use_persistent_containers: bool,
    pub container_startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_execution_timeout: Duration,
    pub max_concurrent_submissions: usize,
    pub container_name_prefix: String,
    pub java_worker_port: u16,
    pub pids_limit: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            use_persistent_containers: true,
            container_startup_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            max_execution_timeout: Duration::from_secs(30),
            max_concurrent_submissions: 8,
            container_name_prefix: "codeduel".to_string(),
            java_worker_port: 8899,
            pids_limit: 128,
        }
    }
}

/// Language configuration manager
///
/// Single source of truth for per-language runtime settings: `config/languages.json`
/// (or the built-in defaults) with environment overrides applied on top.
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
    settings: EngineSettings,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(EngineError::Configuration(format!(
                "Language config file not found: {}",
                config_path.display()
            )));
        }

        let content = fs::read_to_string(config_path)?;
        let languages_json: LanguagesJson = serde_json::from_str(&content).map_err(|e| {
            EngineError::Configuration(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;

        Self::from_configs(languages_json.languages, EngineSettings::default())
    }

    /// Load from `CODEDUEL_LANGUAGES` (default `config/languages.json`), falling back to the
    /// built-in table when the file is missing, then apply environment overrides
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("CODEDUEL_LANGUAGES")
            .unwrap_or_else(|_| "config/languages.json".to_string());
        let manager = if Path::new(&path).exists() {
            Self::load(Path::new(&path))?
        } else {
            tracing::warn!(path = %path, "languages.json not found, using built-in language table");
            Self::builtin()
        };
        manager.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Built-in table mirroring config/languages.json
    pub fn builtin() -> Self {
        let configs = vec![
            LanguageConfig {
                name: Language::Python,
                aliases: vec!["py".to_string(), "python3".to_string()],
                image: "python:3.9-alpine".to_string(),
                env_prefix: "PYTHON".to_string(),
                source_file: "main.py".to_string(),
                memory_limit: "128m".to_string(),
                cpu_limit: 0.3,
                timeout_seconds: 10,
                batch_strategy: BatchStrategy::PerCase,
                compile_flags: vec![],
                run_flags: vec!["-u".to_string()],
            },
            LanguageConfig {
                name: Language::JavaScript,
                aliases: vec!["js".to_string(), "node".to_string()],
                image: "node:16-alpine".to_string(),
                env_prefix: "NODE".to_string(),
                source_file: "main.js".to_string(),
                memory_limit: "128m".to_string(),
                cpu_limit: 0.3,
                timeout_seconds: 10,
                batch_strategy: BatchStrategy::PerCase,
                compile_flags: vec![],
                run_flags: vec![],
            },
            LanguageConfig {
                name: Language::Java,
                aliases: vec![],
                image: "openjdk:11-jdk-slim".to_string(),
                env_prefix: "JAVA".to_string(),
                source_file: "CdHarness.java".to_string(),
                memory_limit: "512m".to_string(),
                cpu_limit: 1.0,
                timeout_seconds: 10,
                batch_strategy: BatchStrategy::PersistentWorker,
                compile_flags: vec![
                    "-nowarn".to_string(),
                    "-encoding".to_string(),
                    "UTF-8".to_string(),
                ],
                run_flags: vec![
                    "-XX:+UseSerialGC".to_string(),
                    "-XX:TieredStopAtLevel=1".to_string(),
                ],
            },
            LanguageConfig {
                name: Language::Cpp,
                aliases: vec!["c++".to_string(), "cxx".to_string()],
                image: "frolvlad/alpine-gxx".to_string(),
                env_prefix: "CPP".to_string(),
                source_file: "main.cpp".to_string(),
                memory_limit: "256m".to_string(),
                cpu_limit: 0.5,
                timeout_seconds: 10,
                batch_strategy: BatchStrategy::CompileOnce,
                compile_flags: vec!["-std=c++17".to_string(), "-O2".to_string()],
                run_flags: vec![],
            },
        ];
        let configs = configs.into_iter().map(|c| (c.name, c)).collect();
        Self {
            configs,
            settings: EngineSettings::default(),
        }
    }

    fn from_configs(list: Vec<LanguageConfig>, settings: EngineSettings) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in list {
            if lang.memory_limit_bytes().is_none() {
                return Err(EngineError::Configuration(format!(
                    "Invalid memory limit '{}' for {}",
                    lang.memory_limit, lang.name
                )));
            }
            if configs.insert(lang.name, lang.clone()).is_some() {
                return Err(EngineError::Configuration(format!(
                    "Duplicate configuration for {}",
                    lang.name
                )));
            }
        }
        Ok(Self { configs, settings })
    }

    /// Apply environment overrides through `lookup`
    ///
    /// Per language: `<PREFIX>_MEMORY_LIMIT`, `<PREFIX>_CPU_LIMIT`, `<PREFIX>_EXECUTION_TIMEOUT`.
    /// Global: `EXECUTION_TIMEOUT`, `DEFAULT_CPU_LIMIT`, `MAX_EXECUTION_TIMEOUT`,
    /// `CONTAINER_STARTUP_TIMEOUT`, `CONTAINER_HEALTH_CHECK_INTERVAL`, `USE_PERSISTENT_CONTAINERS`,
    /// `MAX_CONCURRENT_SUBMISSIONS`, `CONTAINER_NAME_PREFIX`, `JAVA_WORKER_PORT`, `CONTAINER_PIDS_LIMIT`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                    EngineError::Configuration(format!("{} must be a whole number, got '{}'", key, raw))
                }),
                None => Ok(None),
            }
        };
        let parse_f64 = |key: &str| -> Result<Option<f64>> {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<f64>() {
                    Ok(v) if v > 0.0 => Ok(Some(v)),
                    _ => Err(EngineError::Configuration(format!(
                        "{} must be a positive number, got '{}'",
                        key, raw
                    ))),
                },
                None => Ok(None),
            }
        };

        let default_timeout = parse_u64("EXECUTION_TIMEOUT")?;
        let default_cpu = parse_f64("DEFAULT_CPU_LIMIT")?;

        for config in self.configs.values_mut() {
            if let Some(t) = default_timeout {
                config.timeout_seconds = t;
            }
            if let Some(c) = default_cpu {
                config.cpu_limit = c;
            }
            let prefix = config.env_prefix.clone();
            if let Some(raw) = lookup(&format!("{}_MEMORY_LIMIT", prefix)) {
                if parse_memory_limit(&raw).is_none() {
                    return Err(EngineError::Configuration(format!(
                        "{}_MEMORY_LIMIT is not a valid size: '{}'",
                        prefix, raw
                    )));
                }
                config.memory_limit = raw;
            }
            if let Some(c) = parse_f64(&format!("{}_CPU_LIMIT", prefix))? {
                config.cpu_limit = c;
            }
            if let Some(t) = parse_u64(&format!("{}_EXECUTION_TIMEOUT", prefix))? {
                config.timeout_seconds = t;
            }
        }

        let settings = &mut self.settings;
        if let Some(raw) = lookup("USE_PERSISTENT_CONTAINERS") {
            settings.use_persistent_containers =
                matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(s) = parse_u64("CONTAINER_STARTUP_TIMEOUT")? {
            settings.container_startup_timeout = Duration::from_secs(s);
        }
        if let Some(s) = parse_u64("CONTAINER_HEALTH_CHECK_INTERVAL")? {
            settings.health_check_interval = Duration::from_secs(s);
        }
        if let Some(s) = parse_u64("MAX_EXECUTION_TIMEOUT")? {
            settings.max_execution_timeout = Duration::from_secs(s.max(1));
        }
        if let Some(n) = parse_u64("MAX_CONCURRENT_SUBMISSIONS")? {
            settings.max_concurrent_submissions = (n as usize).max(1);
        }
        if let Some(prefix) = lookup("CONTAINER_NAME_PREFIX") {
            settings.container_name_prefix = prefix;
        }
        if let Some(port) = parse_u64("JAVA_WORKER_PORT")? {
            settings.java_worker_port = u16::try_from(port).map_err(|_| {
                EngineError::Configuration(format!("JAVA_WORKER_PORT out of range: {}", port))
            })?;
        }
        if let Some(pids) = parse_u64("CONTAINER_PIDS_LIMIT")? {
            settings.pids_limit = pids as i64;
        }

        Ok(self)
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: Language) -> Result<&LanguageConfig> {
        self.configs
            .get(&language)
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    /// Strategy after accounting for pooling: a persistent worker needs a persistent container
    pub fn effective_strategy(&self, language: Language) -> Result<BatchStrategy> {
        let strategy = self.get_config(language)?.batch_strategy;
        if strategy == BatchStrategy::PersistentWorker && !self.settings.use_persistent_containers {
            return Ok(BatchStrategy::CompileOnce);
        }
        Ok(strategy)
    }

    /// Per-run wall clock limit: the caller's request, else the language default, capped
    pub fn execution_timeout(&self, language: Language, requested_seconds: Option<u64>) -> Result<Duration> {
        let default = self.get_config(language)?.timeout_seconds;
        let requested = Duration::from_secs(requested_seconds.unwrap_or(default).max(1));
        Ok(requested.min(self.settings.max_execution_timeout))
    }

    /// Resolve a caller-supplied language name: canonical names first, then configured aliases
    pub fn resolve_language(&self, raw: &str) -> Result<Language> {
        let wanted = raw.trim().to_lowercase();
        if let Ok(language) = wanted.parse::<Language>() {
            if self.configs.contains_key(&language) {
                return Ok(language);
            }
        }
        self.configs
            .values()
            .find(|c| c.aliases.iter().any(|a| a.to_lowercase() == wanted))
            .map(|c| c.name)
            .ok_or_else(|| EngineError::UnsupportedLanguage(raw.to_string()))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort();
        languages
    }
}

/// Parse a Docker-style memory size (`512m`, `1g`, `64mb`, raw bytes)
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(n) = limit.strip_suffix("gb").or_else(|| limit.strip_suffix('g')) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix("mb").or_else(|| limit.strip_suffix('m')) {
        (n, 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix("kb").or_else(|| limit.strip_suffix('k')) {
        (n, 1024)
    } else {
        (limit.strip_suffix('b').unwrap_or(limit.as_str()), 1)
    };

    let num: i64 = num_str.trim().parse().ok()?;
    if num <= 0 {
        return None;
    }
    num.checked_mul(multiplier)
}
