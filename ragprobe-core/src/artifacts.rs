//! Run artifact persistence.
//!
//! Every run writes an independent directory under
//! `<data_dir>/runs/<YYYYMMDDTHHMMSSZ>_<run_id>/` holding the retrieval
//! table, the metric table, and the summary. Nothing is edited in place;
//! a new run produces a fresh set of files. Directory names sort
//! lexically in chronological order, which is what the listing relies on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::types::{
    MetricRecord, Question, QuestionCategory, Reference, RetrievalRecord, RetrievedChunk,
    SummaryReport,
};

pub const QUESTIONS_CSV: &str = "questions.csv";
pub const RETRIEVAL_CSV: &str = "retrieval.csv";
pub const METRICS_CSV: &str = "metrics.csv";
pub const SUMMARY_JSON: &str = "summary.json";

const RUNS_DIR: &str = "runs";

/// Locations of the files one run produced. Paths are absent for stages
/// that did not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub run_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions_csv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_csv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_csv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_json: Option<PathBuf>,
}

impl ArtifactPaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ..Default::default()
        }
    }
}

/// One persisted run directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    /// Directory name, `<timestamp>_<run_id>`.
    pub name: String,
    pub path: PathBuf,
    pub has_summary: bool,
}

/// Reads and writes run artifacts under a data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    data_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.data_dir.clone())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn runs_dir(&self) -> PathBuf {
        self.data_dir.join(RUNS_DIR)
    }

    /// Create the directory for a new run.
    pub fn create_run_dir(&self, run_id: Uuid) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let dir = self.runs_dir().join(format!("{}_{}", stamp, run_id));
        std::fs::create_dir_all(&dir)?;
        debug!(run_dir = %dir.display(), "Created run directory");
        Ok(dir)
    }

    /// Persist the question set used by a run, in the input CSV schema.
    pub fn write_questions(&self, run_dir: &Path, questions: &[Question]) -> Result<PathBuf> {
        let path = run_dir.join(QUESTIONS_CSV);
        let mut writer = csv::Writer::from_path(&path)?;
        for question in questions {
            writer.serialize(QuestionRow {
                question: question.text.clone(),
                reference: Reference::format_list(&question.references),
                category: question.category.code().to_string(),
                theme: question.theme.clone().unwrap_or_default(),
            })?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Load a question CSV (`question, reference, type, theme`). Ids are
    /// assigned here. Rows with an empty question or an unrecognized
    /// category are skipped with a warning rather than failing the file.
    pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
        if !path.exists() {
            return Err(PipelineError::ArtifactMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut questions = Vec::new();
        for row in reader.deserialize() {
            let row: QuestionRow = row?;
            if row.question.trim().is_empty() {
                continue;
            }
            let Some(category) = QuestionCategory::from_label(&row.category) else {
                warn!(
                    question = %row.question,
                    category = %row.category,
                    "Skipping question with unrecognized category"
                );
                continue;
            };
            let mut question = Question::new(
                category,
                row.question.trim(),
                Reference::parse_list(&row.reference),
            );
            if !row.theme.trim().is_empty() {
                question.theme = Some(row.theme.trim().to_string());
            }
            questions.push(question);
        }
        debug!(count = questions.len(), path = %path.display(), "Loaded questions");
        Ok(questions)
    }

    /// Write the retrieval table: one row per question, answers and chunks
    /// filled in from its record.
    pub fn write_retrieval(
        &self,
        run_dir: &Path,
        questions: &[Question],
        records: &[RetrievalRecord],
    ) -> Result<PathBuf> {
        let path = run_dir.join(RETRIEVAL_CSV);
        let mut writer = csv::Writer::from_path(&path)?;
        for question in questions {
            let Some(record) = records.iter().find(|r| r.question_id == question.id) else {
                warn!(question_id = %question.id, "Question has no retrieval record; row omitted");
                continue;
            };
            let retrieved_chunks = if record.retrieved_chunks.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&record.retrieved_chunks)?
            };
            writer.serialize(RetrievalRow {
                question_id: question.id,
                question: question.text.clone(),
                answer: record.answer_text.clone(),
                answer_chapter: record.answer_chapter.clone(),
                reference: Reference::format_list(&question.references),
                category: question.category.code().to_string(),
                theme: question.theme.clone().unwrap_or_default(),
                retrieved_context: record.context(),
                retrieved_chunks,
                latency_ms: record.latency_ms,
                succeeded: record.succeeded,
                failure_reason: record.failure_reason.clone().unwrap_or_default(),
            })?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Load a retrieval table back into `(Question, RetrievalRecord)` pairs,
    /// preserving the ids the run assigned.
    pub fn load_retrieval(path: &Path) -> Result<(Vec<Question>, Vec<RetrievalRecord>)> {
        if !path.exists() {
            return Err(PipelineError::ArtifactMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut questions = Vec::new();
        let mut records = Vec::new();
        for row in reader.deserialize() {
            let row: RetrievalRow = row?;
            let Some(category) = QuestionCategory::from_label(&row.category) else {
                warn!(
                    question_id = %row.question_id,
                    category = %row.category,
                    "Skipping retrieval row with unrecognized category"
                );
                continue;
            };
            let retrieved_chunks: Vec<RetrievedChunk> = if row.retrieved_chunks.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&row.retrieved_chunks)?
            };
            questions.push(Question {
                id: row.question_id,
                category,
                text: row.question,
                references: Reference::parse_list(&row.reference),
                theme: if row.theme.trim().is_empty() {
                    None
                } else {
                    Some(row.theme)
                },
            });
            records.push(RetrievalRecord {
                question_id: row.question_id,
                answer_text: row.answer,
                answer_chapter: row.answer_chapter,
                retrieved_chunks,
                latency_ms: row.latency_ms,
                succeeded: row.succeeded,
                failure_reason: if row.failure_reason.is_empty() {
                    None
                } else {
                    Some(row.failure_reason)
                },
            });
        }
        Ok((questions, records))
    }

    pub fn write_metrics(&self, run_dir: &Path, metrics: &[MetricRecord]) -> Result<PathBuf> {
        let path = run_dir.join(METRICS_CSV);
        let mut writer = csv::Writer::from_path(&path)?;
        for metric in metrics {
            writer.serialize(metric)?;
        }
        writer.flush()?;
        Ok(path)
    }

    pub fn load_metrics(path: &Path) -> Result<Vec<MetricRecord>> {
        if !path.exists() {
            return Err(PipelineError::ArtifactMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut metrics = Vec::new();
        for row in reader.deserialize() {
            metrics.push(row?);
        }
        Ok(metrics)
    }

    /// Write the summary atomically (temp file, then rename) so a crash
    /// mid-write never leaves a truncated summary behind.
    pub fn write_summary(&self, run_dir: &Path, summary: &SummaryReport) -> Result<PathBuf> {
        let path = run_dir.join(SUMMARY_JSON);
        let json = serde_json::to_string_pretty(summary)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    pub fn load_summary(path: &Path) -> Result<SummaryReport> {
        if !path.exists() {
            return Err(PipelineError::ArtifactMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// All persisted runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunEntry>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            entries.push(RunEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                has_summary: path.join(SUMMARY_JSON).exists(),
                path,
            });
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// Summary of the newest run that wrote one.
    pub fn latest_summary(&self) -> Result<Option<(RunEntry, SummaryReport)>> {
        for entry in self.list_runs()? {
            if entry.has_summary {
                let summary = Self::load_summary(&entry.path.join(SUMMARY_JSON))?;
                return Ok(Some((entry, summary)));
            }
        }
        Ok(None)
    }

    /// Retrieval table of the newest run that wrote one.
    pub fn latest_retrieval(&self) -> Result<Option<PathBuf>> {
        for entry in self.list_runs()? {
            let path = entry.path.join(RETRIEVAL_CSV);
            if path.exists() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

/// Input-schema row: `question, reference, type, theme`. Extra columns in
/// hand-built files are ignored on load.
#[derive(Debug, Serialize, Deserialize)]
struct QuestionRow {
    question: String,
    #[serde(default)]
    reference: String,
    #[serde(rename = "type", default)]
    category: String,
    #[serde(default)]
    theme: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrievalRow {
    question_id: Uuid,
    question: String,
    answer: String,
    answer_chapter: String,
    reference: String,
    #[serde(rename = "type")]
    category: String,
    theme: String,
    retrieved_context: String,
    /// Full chunk list as a JSON cell, kept for recall@k recomputation.
    retrieved_chunks: String,
    latency_ms: u64,
    succeeded: bool,
    failure_reason: String,
}
