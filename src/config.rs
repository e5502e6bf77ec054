//! TOML configuration.
//!
//! Every section has defaults, so a config file only needs `[db] path`.
//! [`load_config`] parses and validates; [`Config::minimal`] builds the
//! all-defaults config used by tests and by `mmrag init` when no file
//! exists yet.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mmrag_core::chunk::ChunkingParams;
use mmrag_core::models::Modality;
use mmrag_core::session::HistoryLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_window_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            window: self.window_chars,
            overlap: self.overlap_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_modalities")]
    pub modalities: Vec<Modality>,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            modalities: default_modalities(),
            embed_concurrency: default_embed_concurrency(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_modalities() -> Vec<Modality> {
    vec![Modality::Text, Modality::Image, Modality::Pdf]
}
fn default_embed_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            timeout_secs: default_embedding_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "clip-vit-b-32".to_string()
}
fn default_dims() -> usize {
    512
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// What to do when a query retrieves nothing.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoResultsPolicy {
    /// Answer with a fixed message without calling the generator.
    #[default]
    ShortCircuit,
    /// Call the generator with an empty context.
    Generate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_history_budget_chars")]
    pub history_budget_chars: usize,
    #[serde(default)]
    pub no_results: NoResultsPolicy,
    #[serde(default)]
    pub rewrite_followups: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_budget_chars: default_context_budget_chars(),
            history_turns: default_history_turns(),
            history_budget_chars: default_history_budget_chars(),
            no_results: NoResultsPolicy::default(),
            rewrite_followups: false,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_context_budget_chars() -> usize {
    6000
}
fn default_history_turns() -> usize {
    10
}
fn default_history_budget_chars() -> usize {
    4000
}

impl RetrievalConfig {
    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_turns: self.history_turns,
            max_chars: self.history_budget_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_generation_model() -> String {
    "llama3.1".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Sessions untouched for this long are dropped from memory. Persisted
    /// turns are reloaded if the id comes back.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            persist: default_persist(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_persist() -> bool {
    true
}
fn default_idle_timeout_secs() -> u64 {
    3600
}

impl Config {
    /// All-defaults config pointing at `db_path`, with both external
    /// services disabled.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            ingest: IngestConfig::default(),
            embedding: EmbeddingConfig {
                provider: "disabled".to_string(),
                ..EmbeddingConfig::default()
            },
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig {
                provider: "disabled".to_string(),
                ..GenerationConfig::default()
            },
            sessions: SessionsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .params()
        .validate()
        .context("invalid [chunking] section")?;

    if config.ingest.max_file_bytes == 0 {
        bail!("ingest.max_file_bytes must be > 0");
    }
    if config.ingest.modalities.is_empty() {
        bail!("ingest.modalities must list at least one modality");
    }
    if config.ingest.embed_concurrency == 0 {
        bail!("ingest.embed_concurrency must be > 0");
    }

    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.embedding.url.is_none() {
                bail!("embedding.url must be set when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, or http.",
            other
        ),
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.context_budget_chars == 0 {
        bail!("retrieval.context_budget_chars must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    if config.sessions.idle_timeout_secs == 0 {
        bail!("sessions.idle_timeout_secs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let config = parse("[db]\npath = \"./data/mmrag.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.window_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.ingest.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.ingest.modalities.len(), 3);
        assert_eq!(config.embedding.dims, 512);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.no_results, NoResultsPolicy::ShortCircuit);
        assert!((config.generation.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.sessions.persist);
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let err = parse(
            "[db]\npath = \"x\"\n[chunking]\nwindow_chars = 100\noverlap_chars = 100\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("overlap"));
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[generation]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"http\"\n").is_err());
    }

    #[test]
    fn test_modalities_and_policy_parse() {
        let config = parse(
            "[db]\npath = \"x\"\n[ingest]\nmodalities = [\"text\", \"pdf\"]\n\
             [retrieval]\nno_results = \"generate\"\ntop_k = 8\n",
        )
        .unwrap();
        assert_eq!(config.ingest.modalities, vec![Modality::Text, Modality::Pdf]);
        assert_eq!(config.retrieval.no_results, NoResultsPolicy::Generate);
        assert_eq!(config.retrieval.top_k, 8);
    }

    #[test]
    fn test_zero_top_k_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[sessions]\nidle_timeout_secs = 0\n").is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/mmrag.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.generation.provider, "ollama");
    }
}
