//! Error types for the ragprobe core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering retrieval, judging, pipeline, and configuration domains.

use std::path::PathBuf;

/// Top-level error type for the ragprobe core library.
#[derive(Debug, thiserror::Error)]
pub enum RagProbeError {
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Errors from retrieval service interactions.
///
/// `Timeout`, `RateLimited`, `Server`, and `Connection` are transient and
/// subject to the retry policy; the rest fail the question immediately.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for {endpoint}")]
    AuthFailed { endpoint: String },

    #[error("Rate limited by service, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Service connection failed: {message}")]
    Connection { message: String },
}

/// Errors from the LLM judge.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge credentials missing: {reason}")]
    MissingCredentials { reason: String },

    #[error("Judge request failed: {message}")]
    ApiRequest { message: String },

    #[error("Judge response parse error: {message}")]
    ResponseParse { message: String },
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Artifact not found: {path}")]
    ArtifactMissing { path: PathBuf },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `RagProbeError`.
pub type Result<T> = std::result::Result<T, RagProbeError>;
