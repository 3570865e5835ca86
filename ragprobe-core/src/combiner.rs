//! Metric combination and summary aggregation.
//!
//! Joins Reference Matcher output with Judge Adapter output into one
//! [`MetricRecord`] per question, then rolls all records up into the
//! run's [`SummaryReport`].

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analyzer::GeneralizationAnalyzer;
use crate::config::ScoringConfig;
use crate::judge::{JudgeCapability, JudgeRequest};
use crate::matcher::ChapterMatcher;
use crate::types::{
    CategoryStats, MetricRecord, Question, QuestionCategory, RetrievalRecord, ScoreDistribution,
    Suggestion, SummaryReport,
};

/// Cutoffs reported for recall@k.
pub const RECALL_KS: [usize; 3] = [3, 5, 10];

const DEFAULT_JUDGE_CONCURRENCY: usize = 4;

/// Scores retrieval records and aggregates them into a summary.
pub struct Evaluator {
    matcher: ChapterMatcher,
    analyzer: GeneralizationAnalyzer,
    judge: JudgeCapability,
    scoring: ScoringConfig,
    judge_concurrency: usize,
}

impl Evaluator {
    pub fn new(judge: JudgeCapability, scoring: ScoringConfig) -> Self {
        Self {
            matcher: ChapterMatcher::new(),
            analyzer: GeneralizationAnalyzer::new(),
            judge,
            scoring,
            judge_concurrency: DEFAULT_JUDGE_CONCURRENCY,
        }
    }

    /// Bound the number of judge calls in flight at once.
    pub fn with_judge_concurrency(mut self, concurrency: usize) -> Self {
        self.judge_concurrency = concurrency.max(1);
        self
    }

    pub fn judge(&self) -> &JudgeCapability {
        &self.judge
    }

    /// Score one question's record.
    ///
    /// Judge availability was resolved up front; a judge call that errors
    /// anyway leaves that question's judge scores empty rather than failing
    /// the run.
    pub async fn score_record(
        &self,
        question: &Question,
        record: &RetrievalRecord,
    ) -> MetricRecord {
        let accuracy = self.matcher.chapter_accuracy(record, &question.references);
        let recall = self.matcher.chapter_recall(record, &question.references);

        let judge_scores = match (&self.judge, record.succeeded) {
            (JudgeCapability::Available(provider), true) => {
                let context = record.context();
                let request = JudgeRequest {
                    question: &question.text,
                    answer: &record.answer_text,
                    context: &context,
                    references: &question.references,
                };
                match provider.score(request).await {
                    Ok(scores) => Some(scores),
                    Err(e) => {
                        warn!(
                            question_id = %question.id,
                            error = %e,
                            "Judge call failed; leaving judge scores empty"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let ragas_overall = judge_scores.as_ref().map(|s| s.overall());
        MetricRecord {
            question_id: question.id,
            chapter_match_accuracy: accuracy,
            chapter_match_recall: recall,
            relevancy: judge_scores.as_ref().map(|s| s.relevancy),
            quality: judge_scores.as_ref().map(|s| s.quality),
            faithfulness: judge_scores.as_ref().and_then(|s| s.faithfulness),
            ragas_overall,
            hybrid_score: hybrid_score(accuracy, ragas_overall, &self.scoring),
        }
    }

    /// Score every (question, record) pair with bounded judge concurrency.
    /// Output order matches input order.
    pub async fn score_all(&self, pairs: &[(Question, RetrievalRecord)]) -> Vec<MetricRecord> {
        stream::iter(pairs.iter().map(|(q, r)| self.score_record(q, r)))
            .buffered(self.judge_concurrency)
            .collect()
            .await
    }

    /// Join questions to their records by id, score them, and aggregate.
    pub async fn evaluate(
        &self,
        run_id: Uuid,
        questions: &[Question],
        records: &[RetrievalRecord],
    ) -> (Vec<MetricRecord>, SummaryReport) {
        let by_id: HashMap<Uuid, &RetrievalRecord> =
            records.iter().map(|r| (r.question_id, r)).collect();
        let pairs: Vec<(Question, RetrievalRecord)> = questions
            .iter()
            .filter_map(|q| by_id.get(&q.id).map(|r| (q.clone(), (*r).clone())))
            .collect();
        debug!(
            questions = questions.len(),
            records = pairs.len(),
            "Scoring retrieval records"
        );
        let metrics = self.score_all(&pairs).await;
        let summary = self.summarize(run_id, questions, records, &metrics);
        (metrics, summary)
    }

    /// Aggregate metric records into the run summary.
    pub fn summarize(
        &self,
        run_id: Uuid,
        questions: &[Question],
        records: &[RetrievalRecord],
        metrics: &[MetricRecord],
    ) -> SummaryReport {
        let record_by_id: HashMap<Uuid, &RetrievalRecord> =
            records.iter().map(|r| (r.question_id, r)).collect();
        let metric_by_id: HashMap<Uuid, &MetricRecord> =
            metrics.iter().map(|m| (m.question_id, m)).collect();

        let total_questions = questions.len();
        let completed = questions
            .iter()
            .filter(|q| record_by_id.get(&q.id).is_some_and(|r| r.succeeded))
            .count();
        let failed = total_questions - completed;
        let not_found_answers = records
            .iter()
            .filter(|r| r.succeeded && r.is_not_found())
            .count();

        let mut recall_at_k = BTreeMap::new();
        for k in RECALL_KS {
            let outcomes: Vec<bool> = questions
                .iter()
                .filter_map(|q| {
                    let record = record_by_id.get(&q.id)?;
                    self.matcher.hit_within_top_k(record, &q.references, k)
                })
                .collect();
            if !outcomes.is_empty() {
                let hits = outcomes.iter().filter(|hit| **hit).count();
                recall_at_k.insert(k, hits as f64 / outcomes.len() as f64);
            }
        }

        let mut latencies: Vec<u64> = records
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| r.latency_ms)
            .collect();
        latencies.sort_unstable();

        let mut per_category: BTreeMap<QuestionCategory, CategoryStats> = BTreeMap::new();
        let mut per_category_relevancy: BTreeMap<QuestionCategory, f64> = BTreeMap::new();
        for category in QuestionCategory::all() {
            let in_category: Vec<&Question> = questions
                .iter()
                .filter(|q| q.category == category)
                .collect();
            if in_category.is_empty() {
                continue;
            }
            let category_completed = in_category
                .iter()
                .filter(|q| record_by_id.get(&q.id).is_some_and(|r| r.succeeded))
                .count();
            let category_metrics: Vec<&&MetricRecord> = in_category
                .iter()
                .filter_map(|q| metric_by_id.get(&q.id))
                .collect();
            let relevancy_avg = mean(category_metrics.iter().filter_map(|m| m.relevancy));
            if let Some(avg) = relevancy_avg {
                per_category_relevancy.insert(category, avg);
            }
            per_category.insert(
                category,
                CategoryStats {
                    questions: in_category.len(),
                    completed: category_completed,
                    failed: in_category.len() - category_completed,
                    accuracy_avg: mean(
                        category_metrics
                            .iter()
                            .filter_map(|m| m.chapter_match_accuracy),
                    ),
                    relevancy_avg,
                    hybrid_avg: mean(category_metrics.iter().filter_map(|m| m.hybrid_score)),
                },
            );
        }

        let mut score_distribution = ScoreDistribution::default();
        for relevancy in metrics.iter().filter_map(|m| m.relevancy) {
            score_distribution.add(relevancy);
        }

        let generalization = self.analyzer.analyze(questions, &per_category_relevancy);

        let mut report = SummaryReport {
            run_id,
            created_at: Utc::now(),
            total_questions,
            completed,
            failed,
            not_found_answers,
            chapter_accuracy_avg: mean(metrics.iter().filter_map(|m| m.chapter_match_accuracy)),
            chapter_recall_avg: mean(metrics.iter().filter_map(|m| m.chapter_match_recall)),
            ragas_available: self.judge.is_available(),
            ragas_unavailable_reason: self.judge.unavailable_reason().map(String::from),
            relevancy_avg: mean(metrics.iter().filter_map(|m| m.relevancy)),
            quality_avg: mean(metrics.iter().filter_map(|m| m.quality)),
            faithfulness_avg: mean(metrics.iter().filter_map(|m| m.faithfulness)),
            ragas_overall_avg: mean(metrics.iter().filter_map(|m| m.ragas_overall)),
            hybrid_avg: mean(metrics.iter().filter_map(|m| m.hybrid_score)),
            recall_at_k,
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p95_ms: percentile(&latencies, 95.0),
            per_category,
            score_distribution,
            generalization,
            suggestions: Vec::new(),
        };
        report.suggestions = self.suggestions_for(&report);
        report
    }

    /// Rule-based improvement suggestions, one per metric below its
    /// configured floor. Metrics with no data never fire.
    fn suggestions_for(&self, report: &SummaryReport) -> Vec<Suggestion> {
        let thresholds = &self.scoring.thresholds;
        let mut suggestions = Vec::new();

        if let Some(value) = report.relevancy_avg {
            if value < thresholds.relevancy {
                suggestions.push(Suggestion {
                    category: "prompt-tuning".to_string(),
                    metric: "relevancy".to_string(),
                    current_value: value,
                    suggestion_text: format!(
                        "Average relevancy is {:.2}, below the {:.2} floor. Revise the answering prompt so responses address the question more directly.",
                        value, thresholds.relevancy
                    ),
                });
            }
        }
        if let Some(value) = report.quality_avg {
            if value < thresholds.quality {
                suggestions.push(Suggestion {
                    category: "prompt-tuning".to_string(),
                    metric: "quality".to_string(),
                    current_value: value,
                    suggestion_text: format!(
                        "Average quality is {:.2}, below the {:.2} floor. Tighten the completeness and formatting instructions in the answering prompt.",
                        value, thresholds.quality
                    ),
                });
            }
        }
        if let Some(value) = report.faithfulness_avg {
            if value < thresholds.faithfulness {
                suggestions.push(Suggestion {
                    category: "prompt-tuning".to_string(),
                    metric: "faithfulness".to_string(),
                    current_value: value,
                    suggestion_text: format!(
                        "Average faithfulness is {:.2}, below the {:.2} floor. Answers drift from the retrieved context; require citations or ground the prompt harder in the provided chunks.",
                        value, thresholds.faithfulness
                    ),
                });
            }
        }
        if let Some(value) = report.recall_at_k.get(&5).copied() {
            if value < thresholds.recall_at_5 {
                suggestions.push(Suggestion {
                    category: "retrieval-tuning".to_string(),
                    metric: "recall_at_5".to_string(),
                    current_value: value,
                    suggestion_text: format!(
                        "Recall@5 is {:.2}, below the {:.2} floor. Increase top_k or rebalance the vector similarity weight so referenced sections surface earlier.",
                        value, thresholds.recall_at_5
                    ),
                });
            }
        }
        if let Some(value) = report.chapter_accuracy_avg {
            if value < thresholds.chapter_accuracy {
                suggestions.push(Suggestion {
                    category: "retrieval-tuning".to_string(),
                    metric: "chapter_accuracy".to_string(),
                    current_value: value,
                    suggestion_text: format!(
                        "Chapter-match accuracy is {:.2}, below the {:.2} floor. Cited sections rarely line up with the references; check dataset coverage and heading extraction.",
                        value, thresholds.chapter_accuracy
                    ),
                });
            }
        }
        suggestions
    }
}

/// Blend chapter accuracy with the judge's overall score. When only one
/// signal is present it stands alone at full weight; with neither, the
/// hybrid score is undefined.
pub fn hybrid_score(
    accuracy: Option<f64>,
    ragas_overall: Option<f64>,
    scoring: &ScoringConfig,
) -> Option<f64> {
    match (accuracy, ragas_overall) {
        (Some(acc), Some(ragas)) => {
            Some(scoring.accuracy_weight * acc + scoring.judge_weight * ragas)
        }
        (Some(acc), None) => Some(acc),
        (None, Some(ragas)) => Some(ragas),
        (None, None) => None,
    }
}

fn mean<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[u64], pct: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}
