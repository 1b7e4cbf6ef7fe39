use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration loaded from a TOML file.
///
/// This is deployment configuration (paths, bind address, provider
/// credentials). Per-knowledge-base chunking/embedding/retrieval settings
/// live in the database and are resolved by [`crate::ragconfig`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7731".to_string()
}

/// Embedding provider credentials and endpoints. API keys are named by the
/// environment variable that holds them so the config file never contains
/// secrets.
#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai_key_env")]
    pub openai_api_key_env: String,
    #[serde(default = "default_cohere_key_env")]
    pub cohere_api_key_env: String,
    /// Endpoint for the generic self-hosted provider, if any.
    #[serde(default)]
    pub custom_endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_api_key_env: default_openai_key_env(),
            cohere_api_key_env: default_cohere_key_env(),
            custom_endpoint: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_cohere_key_env() -> String {
    "COHERE_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Concurrent document limit for batch ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Cap on retained in-memory processing jobs.
    #[serde(default = "default_job_cap")]
    pub job_cap: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_cap: default_job_cap(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}
fn default_job_cap() -> usize {
    100
}

impl Config {
    /// Minimal in-memory config for tests and ad-hoc tooling.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            providers: ProvidersConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be > 0");
    }
    if config.ingest.job_cap == 0 {
        anyhow::bail!("ingest.job_cap must be > 0");
    }
    if config.providers.timeout_secs == 0 {
        anyhow::bail!("providers.timeout_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/ragkit.sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:7731");
        assert_eq!(cfg.ingest.concurrency, 3);
        assert_eq!(cfg.providers.openai_api_key_env, "OPENAI_API_KEY");
        assert!(cfg.providers.custom_endpoint.is_none());
    }

    #[test]
    fn test_minimal() {
        let cfg = Config::minimal(":memory:");
        assert_eq!(cfg.ingest.job_cap, 100);
    }
}
