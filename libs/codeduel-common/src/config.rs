// Process-level settings shared by the worker and the CLI
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub redis_url: String,
    pub problems_dir: PathBuf,
    pub result_ttl_seconds: u64,
    pub queue_pop_timeout_seconds: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            problems_dir: PathBuf::from("data/problems"),
            result_ttl_seconds: 86_400,
            queue_pop_timeout_seconds: 5.0,
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup; unparsable values keep the default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(url) = lookup("REDIS_URL") {
            settings.redis_url = url;
        }
        if let Some(dir) = lookup("CODEDUEL_PROBLEMS_DIR") {
            settings.problems_dir = PathBuf::from(dir);
        }
        if let Some(ttl) = lookup("RESULT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            settings.result_ttl_seconds = ttl;
        }
        if let Some(wait) = lookup("QUEUE_POP_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            settings.queue_pop_timeout_seconds = wait;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides_and_fallbacks() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REDIS_URL", "redis://cache:6379"),
            ("RESULT_TTL_SECONDS", "not-a-number"),
            ("QUEUE_POP_TIMEOUT_SECONDS", "1.5"),
        ]);
        let settings = RuntimeSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.redis_url, "redis://cache:6379");
        assert_eq!(settings.result_ttl_seconds, 86_400);
        assert_eq!(settings.queue_pop_timeout_seconds, 1.5);
        assert_eq!(settings.problems_dir, PathBuf::from("data/problems"));
    }
}
