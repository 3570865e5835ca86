//! Core type definitions for the ragprobe pipeline.
//!
//! Defines the fundamental data structures used throughout the system:
//! questions and their references, retrieval records, metric records, and
//! the aggregate summary report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Separator between the source document and the heading in a serialized
/// reference entry (`source|heading`).
pub const REFERENCE_SEPARATOR: char = '|';

/// Separator between reference entries when a question has several
/// (`source|heading;source|heading`).
pub const REFERENCE_LIST_SEPARATOR: char = ';';

/// Phrases the retrieval service uses for empty-handed answers. Answers
/// containing one of these still score normally but are counted separately
/// in the summary.
pub const NOT_FOUND_MARKERS: &[&str] = &["no relevant content", "not found in the knowledge base"];

/// Number of top chunks assembled into the judged context.
pub const CONTEXT_CHUNK_COUNT: usize = 3;

/// Separator between chunks in the assembled context.
pub const CONTEXT_CHUNK_SEPARATOR: &str = "\n---\n";

/// The six probe-question classes.
///
/// S1–S5 are factual probes of increasing structural difficulty; S6 holds
/// adversarial and sensitive probes that are routed to a hardened retrieval
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuestionCategory {
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
}

impl QuestionCategory {
    /// All categories in order.
    pub fn all() -> [QuestionCategory; 6] {
        [
            QuestionCategory::S1,
            QuestionCategory::S2,
            QuestionCategory::S3,
            QuestionCategory::S4,
            QuestionCategory::S5,
            QuestionCategory::S6,
        ]
    }

    /// Parse a category from a free-form label such as `"S3"` or
    /// `"S6 adversarial"`. Labels are matched by their category code,
    /// case-insensitively.
    pub fn from_label(label: &str) -> Option<QuestionCategory> {
        let upper = label.to_uppercase();
        QuestionCategory::all()
            .into_iter()
            .find(|c| upper.contains(c.code()))
    }

    /// The short category code (`"S1"`..`"S6"`).
    pub fn code(&self) -> &'static str {
        match self {
            QuestionCategory::S1 => "S1",
            QuestionCategory::S2 => "S2",
            QuestionCategory::S3 => "S3",
            QuestionCategory::S4 => "S4",
            QuestionCategory::S5 => "S5",
            QuestionCategory::S6 => "S6",
        }
    }

    /// Human-readable title for display surfaces.
    pub fn title(&self) -> &'static str {
        match self {
            QuestionCategory::S1 => "Numeric lookup",
            QuestionCategory::S2 => "Error code lookup",
            QuestionCategory::S3 => "Multiple choice",
            QuestionCategory::S4 => "Single-document multi-segment",
            QuestionCategory::S5 => "Cross-document multi-segment",
            QuestionCategory::S6 => "Adversarial probe",
        }
    }

    /// One-line description of what the category probes.
    pub fn description(&self) -> &'static str {
        match self {
            QuestionCategory::S1 => "Questions whose answer is a non-date number.",
            QuestionCategory::S2 => "Questions whose answer is an error code or message.",
            QuestionCategory::S3 => "Four-option multiple choice built around a named entity.",
            QuestionCategory::S4 => "Questions drawn from several segments of one document.",
            QuestionCategory::S5 => "Questions drawn from segments across documents.",
            QuestionCategory::S6 => {
                "Adversarial questions probing for sensitive or out-of-scope content."
            }
        }
    }

    /// Adversarial and sensitive probes require the hardened retrieval
    /// target.
    pub fn is_adversarial(&self) -> bool {
        matches!(self, QuestionCategory::S6)
    }
}

impl std::fmt::Display for QuestionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A ground-truth reference location: which document and which heading the
/// answer should come from.
///
/// Serialized as `source|heading`; multiple references join with `;`. A
/// malformed entry (missing separator, empty source or heading) is kept so
/// it still counts toward recall denominators, but it can never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub source_document: String,
    pub heading: String,
}

impl Reference {
    pub fn new(source_document: impl Into<String>, heading: impl Into<String>) -> Self {
        Self {
            source_document: source_document.into(),
            heading: heading.into(),
        }
    }

    /// Parse a single `source|heading` entry. An entry without the separator
    /// keeps the whole string as the source and leaves the heading empty.
    pub fn parse(entry: &str) -> Reference {
        match entry.split_once(REFERENCE_SEPARATOR) {
            Some((source, heading)) => Reference::new(source.trim(), heading.trim()),
            None => Reference::new(entry.trim(), ""),
        }
    }

    /// Parse a `;`-joined reference list. Empty segments are dropped;
    /// malformed segments are kept as non-matchable entries.
    pub fn parse_list(serialized: &str) -> Vec<Reference> {
        serialized
            .split(REFERENCE_LIST_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Reference::parse)
            .collect()
    }

    /// Serialize a reference list back to `source|heading;…` form.
    pub fn format_list(references: &[Reference]) -> String {
        references
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(&REFERENCE_LIST_SEPARATOR.to_string())
    }

    /// A reference can only match when both halves are present.
    pub fn is_well_formed(&self) -> bool {
        !self.source_document.is_empty() && !self.heading.is_empty()
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.source_document, REFERENCE_SEPARATOR, self.heading
        )
    }
}

/// An immutable probe question, produced by question generation and consumed
/// read-only by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub category: QuestionCategory,
    pub text: String,
    pub references: Vec<Reference>,
    /// Document set the question was generated from; carried through to the
    /// artifacts for bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

impl Question {
    pub fn new(
        category: QuestionCategory,
        text: impl Into<String>,
        references: Vec<Reference>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            text: text.into(),
            references,
            theme: None,
        }
    }
}

/// One chunk returned by the retrieval service, ordered by descending
/// similarity within a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub source_document: String,
    pub heading: String,
    pub similarity: f64,
}

/// The terminal outcome of retrieving one question. Created exactly once per
/// question per run and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub question_id: Uuid,
    pub answer_text: String,
    pub answer_chapter: String,
    pub retrieved_chunks: Vec<RetrievedChunk>,
    pub latency_ms: u64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl RetrievalRecord {
    pub fn success(
        question_id: Uuid,
        answer_text: impl Into<String>,
        answer_chapter: impl Into<String>,
        retrieved_chunks: Vec<RetrievedChunk>,
        latency_ms: u64,
    ) -> Self {
        Self {
            question_id,
            answer_text: answer_text.into(),
            answer_chapter: answer_chapter.into(),
            retrieved_chunks,
            latency_ms,
            succeeded: true,
            failure_reason: None,
        }
    }

    pub fn failure(question_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            question_id,
            answer_text: String::new(),
            answer_chapter: String::new(),
            retrieved_chunks: Vec::new(),
            latency_ms: 0,
            succeeded: false,
            failure_reason: Some(reason.into()),
        }
    }

    /// Assemble the context passed to the judge: contents of the top chunks
    /// joined by the chunk separator.
    pub fn context(&self) -> String {
        self.retrieved_chunks
            .iter()
            .take(CONTEXT_CHUNK_COUNT)
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_CHUNK_SEPARATOR)
    }

    /// Whether the service answered with its "nothing relevant" phrasing.
    pub fn is_not_found(&self) -> bool {
        let answer = self.answer_text.to_lowercase();
        NOT_FOUND_MARKERS.iter().any(|m| answer.contains(m))
    }
}

/// Per-question metric outcome. Judge-derived fields are `None` when the
/// judge is unavailable or its call failed for this question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub question_id: Uuid,
    /// 1.0 when the answer chapter matches any reference, 0.0 when it
    /// matches none, `None` for failed retrievals.
    pub chapter_match_accuracy: Option<f64>,
    pub chapter_match_recall: Option<f64>,
    pub relevancy: Option<f64>,
    pub quality: Option<f64>,
    pub faithfulness: Option<f64>,
    pub ragas_overall: Option<f64>,
    pub hybrid_score: Option<f64>,
}

/// Per-category rollup inside the summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub questions: usize,
    pub completed: usize,
    pub failed: usize,
    pub accuracy_avg: Option<f64>,
    pub relevancy_avg: Option<f64>,
    pub hybrid_avg: Option<f64>,
}

/// Relevancy score buckets. Bucket counts partition exactly the set of
/// questions with a non-`None` relevancy score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    /// `relevancy >= 0.8`
    pub excellent: usize,
    /// `0.6 <= relevancy < 0.8`
    pub good: usize,
    /// `0.4 <= relevancy < 0.6`
    pub fair: usize,
    /// `relevancy < 0.4`
    pub poor: usize,
}

impl ScoreDistribution {
    /// Count one relevancy score into its bucket.
    pub fn add(&mut self, score: f64) {
        if score >= 0.8 {
            self.excellent += 1;
        } else if score >= 0.6 {
            self.good += 1;
        } else if score >= 0.4 {
            self.fair += 1;
        } else {
            self.poor += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.excellent + self.good + self.fair + self.poor
    }
}

/// Corpus-level balance classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneralizationLevel {
    High,
    Medium,
    Low,
    Balanced,
}

impl std::fmt::Display for GeneralizationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneralizationLevel::High => write!(f, "high"),
            GeneralizationLevel::Medium => write!(f, "medium"),
            GeneralizationLevel::Low => write!(f, "low"),
            GeneralizationLevel::Balanced => write!(f, "balanced"),
        }
    }
}

/// Question-corpus composition report produced by the generalization
/// analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralizationReport {
    pub specific_count: usize,
    pub generalization_count: usize,
    pub mixed_count: usize,
    pub specific_ratio: f64,
    pub generalization_ratio: f64,
    pub mixed_ratio: f64,
    pub level: GeneralizationLevel,
    /// Balance score from the variance of per-category average relevancy;
    /// `None` when fewer than two categories carry relevancy data.
    pub score: Option<f64>,
}

/// A rule-based improvement suggestion emitted when a metric falls below its
/// configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub category: String,
    pub metric: String,
    pub current_value: f64,
    pub suggestion_text: String,
}

/// Aggregate over one run. Percentage views are derived from the stored
/// counts and averages via methods; they are never stored independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub total_questions: usize,
    pub completed: usize,
    pub failed: usize,
    pub not_found_answers: usize,
    pub chapter_accuracy_avg: Option<f64>,
    pub chapter_recall_avg: Option<f64>,
    pub ragas_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ragas_unavailable_reason: Option<String>,
    pub relevancy_avg: Option<f64>,
    pub quality_avg: Option<f64>,
    pub faithfulness_avg: Option<f64>,
    pub ragas_overall_avg: Option<f64>,
    pub hybrid_avg: Option<f64>,
    /// Recall@k for k in {3, 5, 10}, over questions with a chapter signal.
    pub recall_at_k: BTreeMap<usize, f64>,
    pub latency_p50_ms: Option<u64>,
    pub latency_p95_ms: Option<u64>,
    pub per_category: BTreeMap<QuestionCategory, CategoryStats>,
    pub score_distribution: ScoreDistribution,
    pub generalization: GeneralizationReport,
    pub suggestions: Vec<Suggestion>,
}

impl SummaryReport {
    /// Chapter-match accuracy as a display percentage.
    pub fn accuracy_percentage(&self) -> Option<f64> {
        self.chapter_accuracy_avg.map(to_percent)
    }

    /// Chapter-match recall as a display percentage.
    pub fn recall_percentage(&self) -> Option<f64> {
        self.chapter_recall_avg.map(to_percent)
    }

    /// Hybrid score as a display percentage.
    pub fn hybrid_percentage(&self) -> Option<f64> {
        self.hybrid_avg.map(to_percent)
    }

    /// Completed questions as a display percentage of the total.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_questions == 0 {
            return 0.0;
        }
        to_percent(self.completed as f64 / self.total_questions as f64)
    }
}

/// Scale a unit-interval value to a percentage rounded to two decimals.
pub(crate) fn to_percent(value: f64) -> f64 {
    (value * 10_000.0).round() / 100.0
}
