//! Central configuration, loaded once from the environment.
//!
//! Domain sub-structs each own their `from_env`; the CLI and HTTP layers
//! apply per-run overrides on top via `RunOptions`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RunError;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "on" | "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Planner model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        Self {
            model: env_str("AI3_PLANNER_MODEL", "claude-3-7-sonnet-20250219"),
            max_tokens: env_parse("AI3_PLANNER_MAXTOK", 4096),
            temperature: env_parse("AI3_PLANNER_TEMPERATURE", 0.0),
        }
    }
}

/// Scheduler concurrency and deadline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrency: usize,
    pub max_concurrency_per_provider: usize,
    pub task_timeout_secs: u64,
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_parse("AI3_MAX_CONCURRENCY", 5),
            max_concurrency_per_provider: env_parse("AI3_MAX_CONCURRENCY_PER_PROVIDER", 3),
            task_timeout_secs: env_parse("AI3_TASK_TIMEOUT_SECS", 120),
        }
    }
}

/// Verification and repair settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    pub enabled: bool,
    pub repair_limit: u32,
}

impl VerifyConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("AI3_VERIFY", true),
            repair_limit: env_parse("AI3_REPAIR_LIMIT", 1),
        }
    }
}

/// Journal and artifact store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub journal_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            journal_dir: PathBuf::from(env_str("AI3_JOURNAL_DIR", "journal")),
            artifacts_dir: PathBuf::from(env_str("AI3_ARTIFACTS_DIR", "artifacts")),
        }
    }
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_str("AI3_HOST", "0.0.0.0"),
            port: env_parse("AI3_PORT", 8000),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ai3Config {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    /// Optional JSON file with model descriptors; built-ins otherwise.
    pub models_file: Option<PathBuf>,
    pub planner: PlannerConfig,
    pub limits: LimitsConfig,
    pub verify: VerifyConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl Ai3Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            xai_api_key: env_opt("XAI_API_KEY"),
            models_file: env_opt("AI3_MODELS_FILE").map(PathBuf::from),
            planner: PlannerConfig::from_env(),
            limits: LimitsConfig::from_env(),
            verify: VerifyConfig::from_env(),
            storage: StorageConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }

    /// Provider ids with a configured key.
    pub fn configured_providers(&self) -> Vec<&'static str> {
        let mut ids = Vec::new();
        if self.anthropic_api_key.is_some() {
            ids.push("anthropic");
        }
        if self.openai_api_key.is_some() {
            ids.push("openai");
        }
        if self.xai_api_key.is_some() {
            ids.push("xai");
        }
        ids
    }

    /// Startup validation. At least one provider key is required, and the
    /// concurrency caps must admit work.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.configured_providers().is_empty() {
            return Err(RunError::Configuration(
                "no provider API key set (need ANTHROPIC_API_KEY, OPENAI_API_KEY, or XAI_API_KEY)"
                    .into(),
            ));
        }
        if self.limits.max_concurrency == 0 || self.limits.max_concurrency_per_provider == 0 {
            return Err(RunError::Configuration(
                "concurrency limits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_a_key() {
        let config = Ai3Config {
            anthropic_api_key: None,
            openai_api_key: None,
            xai_api_key: None,
            models_file: None,
            planner: PlannerConfig {
                model: "m".into(),
                max_tokens: 4096,
                temperature: 0.0,
            },
            limits: LimitsConfig {
                max_concurrency: 5,
                max_concurrency_per_provider: 3,
                task_timeout_secs: 120,
            },
            verify: VerifyConfig {
                enabled: true,
                repair_limit: 1,
            },
            storage: StorageConfig {
                journal_dir: "journal".into(),
                artifacts_dir: "artifacts".into(),
            },
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8000,
            },
        };
        assert!(config.validate().is_err());

        let config = Ai3Config {
            openai_api_key: Some("sk-test".into()),
            ..config
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.configured_providers(), vec!["openai"]);
    }
}
