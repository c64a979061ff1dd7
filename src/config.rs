use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sampler::SamplerConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
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
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Label reported in response metadata.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Used when a request does not say.
    #[serde(default)]
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
            model_version: default_model_version(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            stream: false,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_model_version() -> String {
    "2024-07-18".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_head_chars")]
    pub head_chars: usize,
    #[serde(default = "default_tail_chars")]
    pub tail_chars: usize,
    #[serde(default = "default_window_radius")]
    pub window_radius: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            head_chars: default_head_chars(),
            tail_chars: default_tail_chars(),
            window_radius: default_window_radius(),
        }
    }
}

impl SamplingConfig {
    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            max_chars: self.max_chars,
            head_chars: self.head_chars,
            tail_chars: self.tail_chars,
            window_radius: self.window_radius,
        }
    }
}

fn default_max_chars() -> usize {
    12_000
}
fn default_head_chars() -> usize {
    6_000
}
fn default_tail_chars() -> usize {
    4_000
}
fn default_window_radius() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_errors")]
    pub default_max_errors: u32,
    /// Version of the reference corpus; part of cache validity.
    #[serde(default = "default_rag_version")]
    pub rag_version: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_max_errors: default_max_errors(),
            rag_version: default_rag_version(),
        }
    }
}

fn default_max_errors() -> u32 {
    50
}
fn default_rag_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `sqlite` or `none` (in-memory only).
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary: default_primary(),
            path: default_cache_path(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_primary() -> String {
    "sqlite".to_string()
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/structlint-cache.sqlite")
}
fn default_ttl_secs() -> u64 {
    86_400
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Config {
    /// All defaults, with the cache kept in memory.
    pub fn minimal() -> Self {
        Self {
            cache: CacheConfig {
                primary: "none".to_string(),
                ..CacheConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sampling;
        if s.head_chars + s.tail_chars >= s.max_chars {
            anyhow::bail!(
                "sampling.head_chars + sampling.tail_chars must be < sampling.max_chars ({} + {} >= {})",
                s.head_chars,
                s.tail_chars,
                s.max_chars
            );
        }

        if self.model.timeout_secs == 0 {
            anyhow::bail!("model.timeout_secs must be > 0");
        }
        if self.model.max_tokens == 0 {
            anyhow::bail!("model.max_tokens must be > 0");
        }

        if !(1..=1000).contains(&self.analysis.default_max_errors) {
            anyhow::bail!("analysis.default_max_errors must be in [1, 1000]");
        }

        match self.cache.primary.as_str() {
            "sqlite" | "none" => {}
            other => anyhow::bail!(
                "Unknown cache primary: '{}'. Must be sqlite or none.",
                other
            ),
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be > 0");
        }
        if self.cache.sweep_interval_secs == 0 {
            anyhow::bail!("cache.sweep_interval_secs must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.model.timeout_secs, 30);
        assert_eq!(config.model.max_retries, 1);
        assert_eq!(config.sampling.max_chars, 12_000);
        assert_eq!(config.analysis.rag_version, "1.0.0");
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.cache.sweep_interval_secs, 300);
        assert_eq!(config.cache.primary, "sqlite");
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [model]
            model = "local-llm"
            base_url = "http://localhost:8080/v1"
            stream = true

            [cache]
            primary = "none"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.model.model, "local-llm");
        assert!(config.model.stream);
        assert_eq!(config.model.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.cache.primary, "none");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::minimal();
        config.sampling.head_chars = 10_000;
        assert!(config.validate().is_err());

        let mut config = Config::minimal();
        config.analysis.default_max_errors = 0;
        assert!(config.validate().is_err());

        let mut config = Config::minimal();
        config.cache.primary = "redis".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("redis"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../config/structlint.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.path, PathBuf::from("./data/structlint-cache.sqlite"));
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("structlint.toml");
        std::fs::write(&path, "[analysis]\nrag_version = \"2.0.0\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.analysis.rag_version, "2.0.0");
        assert!(load_config(&tmp.path().join("missing.toml")).is_err());
    }
}
