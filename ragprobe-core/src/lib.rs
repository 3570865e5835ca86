//! # RagProbe Core
//!
//! Core library for the RagProbe retrieval-evaluation pipeline.
//! Provides the pipeline orchestrator, retrieval coordinator, chapter
//! matcher, LLM judge adapter, metric aggregation, configuration, and
//! fundamental types.

pub mod analyzer;
pub mod artifacts;
pub mod combiner;
pub mod config;
pub mod error;
pub mod events;
pub mod judge;
pub mod matcher;
pub mod pipeline;
pub mod retrieval;
pub mod retry;
pub mod types;

// Re-export commonly used types at the crate root.
pub use analyzer::{GeneralizationAnalyzer, QuestionStyle};
pub use artifacts::{ArtifactPaths, ArtifactStore, RunEntry};
pub use combiner::Evaluator;
pub use config::{load_config, EvalConfig, JudgeConfig, RetrievalConfig, RetryPolicy, ScoringConfig};
pub use error::{RagProbeError, Result};
pub use events::{EventSink, ModuleStatus, PipelineModule, ProgressEvent};
pub use judge::{JudgeCapability, JudgeProvider, JudgeScores, LlmJudge};
pub use matcher::ChapterMatcher;
pub use pipeline::{
    FormatConverter, PipelineOrchestrator, PipelineOutcome, QuestionProvider, RunOptions,
};
pub use retrieval::{
    HttpRetrievalClient, RetrievalClient, RetrievalCoordinator, RoutingTable, SearchRequest,
    SearchResponse,
};
pub use types::{
    CategoryStats, GeneralizationLevel, GeneralizationReport, MetricRecord, Question,
    QuestionCategory, Reference, RetrievalRecord, RetrievedChunk, ScoreDistribution, Suggestion,
    SummaryReport,
};
