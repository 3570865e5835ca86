//! Configuration system for ragprobe.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Configuration
//! is loaded from `~/.config/ragprobe/config.toml` and/or
//! `.ragprobe/config.toml` in the workspace directory; environment variables
//! use the `RAGPROBE_` prefix with `__` separating sections
//! (`RAGPROBE_RETRIEVAL__TOP_K=10`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the evaluation pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalConfig {
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
    pub judge: JudgeConfig,
    pub scoring: ScoringConfig,
    pub storage: StorageConfig,
}

impl EvalConfig {
    /// Collect non-fatal configuration warnings across all sections.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.retrieval.validate() {
            warnings.push(format!("[retrieval] {}", w));
        }
        for w in self.scoring.validate() {
            warnings.push(format!("[scoring] {}", w));
        }
        if self.judge.enabled && self.judge.api_key().is_none() {
            warnings.push(format!(
                "[judge] enabled but environment variable '{}' is not set; judge scoring will be unavailable",
                self.judge.api_key_env
            ));
        }
        warnings
    }
}

/// Connection and pacing settings for the retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the retrieval API.
    pub endpoint: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Dataset ids queried for the general-purpose categories (S1–S5).
    #[serde(default)]
    pub general_datasets: Vec<String>,
    /// Dataset ids queried for adversarial probes (S6).
    #[serde(default)]
    pub hardened_datasets: Vec<String>,
    /// Number of chunks requested per query.
    pub top_k: usize,
    /// Minimum similarity for a chunk to be returned.
    pub similarity_threshold: f64,
    /// Weight of vector similarity versus term matching.
    pub vector_similarity_weight: f64,
    /// Concurrent retrieval workers.
    pub workers: usize,
    /// Delay between requests issued by one worker.
    pub request_delay_ms: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9380".to_string(),
            api_key_env: "RETRIEVAL_API_KEY".to_string(),
            general_datasets: Vec::new(),
            hardened_datasets: Vec::new(),
            top_k: 5,
            similarity_threshold: 0.0,
            vector_similarity_weight: 0.3,
            workers: 1,
            request_delay_ms: 500,
            timeout_secs: 30,
        }
    }
}

impl RetrievalConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.workers == 0 {
            warnings.push("workers is 0; clamped to 1 at run time".to_string());
        }
        if self.workers > 5 {
            warnings.push(format!(
                "workers is {}; more than 5 concurrent requests tends to trip service rate limits",
                self.workers
            ));
        }
        if self.top_k == 0 {
            warnings.push("top_k is 0; no chunks will be retrieved".to_string());
        }
        if self.general_datasets.is_empty() {
            warnings.push("no general datasets configured".to_string());
        }
        if self.hardened_datasets.is_empty() {
            warnings.push(
                "no hardened datasets configured; S6 questions will fail rather than fall back"
                    .to_string(),
            );
        }
        warnings
    }
}

/// Retry policy for transient retrieval failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Settings for the LLM judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Disable to force structural-only scoring.
    pub enabled: bool,
    /// OpenAI-compatible API base URL.
    pub base_url: String,
    /// Model used for judging.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

impl JudgeConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Hybrid-score weights and suggestion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of chapter-match accuracy in the hybrid score.
    pub accuracy_weight: f64,
    /// Weight of the judge's overall score in the hybrid score.
    pub judge_weight: f64,
    pub thresholds: SuggestionThresholds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            accuracy_weight: 0.4,
            judge_weight: 0.6,
            thresholds: SuggestionThresholds::default(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let sum = self.accuracy_weight + self.judge_weight;
        if (sum - 1.0).abs() > 1e-9 {
            warnings.push(format!(
                "accuracy_weight + judge_weight is {}; hybrid scores will not stay in [0, 1]",
                sum
            ));
        }
        warnings
    }
}

/// Metric floors below which an optimization suggestion is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionThresholds {
    pub relevancy: f64,
    pub quality: f64,
    pub faithfulness: f64,
    pub recall_at_5: f64,
    pub chapter_accuracy: f64,
}

impl Default for SuggestionThresholds {
    fn default() -> Self {
        Self {
            relevancy: 0.6,
            quality: 0.6,
            faithfulness: 0.6,
            recall_at_5: 0.7,
            chapter_accuracy: 0.7,
        }
    }
}

/// Where run artifacts are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Load configuration with full layering:
/// 1. Built-in defaults
/// 2. User config file (`~/.config/ragprobe/config.toml`)
/// 3. Workspace config file (`<workspace>/.ragprobe/config.toml`)
/// 4. Environment variables (`RAGPROBE_RETRIEVAL__TOP_K`, etc.)
/// 5. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EvalConfig>,
) -> Result<EvalConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EvalConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "ragprobe", "ragprobe") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".ragprobe").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables
    figment = figment.merge(Env::prefixed("RAGPROBE_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
