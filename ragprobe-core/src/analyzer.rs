//! Question-corpus generalization analysis.
//!
//! Classifies each question as `specific`, `generalization`, or `mixed`
//! by the markers in its text, derives a corpus-level label from the
//! class ratios, and computes a balance score from the spread of
//! per-category relevancy averages.

use regex::Regex;
use std::collections::BTreeMap;

use crate::types::{GeneralizationLevel, GeneralizationReport, Question, QuestionCategory};

/// Phrases that mark a question as asking about processes, definitions,
/// or causes rather than a single concrete fact.
const ABSTRACTION_MARKERS: &[&str] = &[
    "what is",
    "what are",
    "define",
    "definition",
    "describe",
    "explain",
    "how do",
    "how does",
    "how to",
    "how can",
    "process",
    "procedure",
    "workflow",
    "why",
    "cause",
    "reason",
    "lead to",
    "result in",
    "impact",
    "effect",
    "difference between",
    "compare",
    "relationship",
    "purpose",
    "overview",
    "in general",
];

/// How a single question's text reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionStyle {
    /// Anchored to concrete values: numbers, error codes, section refs.
    Specific,
    /// Process, definition, or causal phrasing without concrete anchors.
    Generalization,
    /// Both marker kinds present.
    Mixed,
}

/// Marker-based classifier over a question corpus.
pub struct GeneralizationAnalyzer {
    numeric: Regex,
    error_code: Regex,
    section_ref: Regex,
}

impl GeneralizationAnalyzer {
    pub fn new() -> Self {
        Self {
            numeric: Regex::new(r"\d+(?:\.\d+)*").unwrap(),
            error_code: Regex::new(r"\b(?:0x[0-9a-fA-F]+|[A-Z]{2,}[-_]\d+|E\d{3,})\b").unwrap(),
            section_ref: Regex::new(r"(?i)(?:§\s*\d|\b(?:section|chapter|page|appendix|step)\s+\d)")
                .unwrap(),
        }
    }

    /// Classify one question text by its markers. Text with neither marker
    /// kind reads as generic phrasing and classifies as `Generalization`.
    pub fn classify(&self, text: &str) -> QuestionStyle {
        let concrete = self.has_concrete_markers(text);
        let abstract_ = has_abstraction_markers(text);
        match (concrete, abstract_) {
            (true, true) => QuestionStyle::Mixed,
            (true, false) => QuestionStyle::Specific,
            (false, _) => QuestionStyle::Generalization,
        }
    }

    /// Classify the whole corpus and attach the relevancy balance score.
    ///
    /// `per_category_relevancy` holds the average relevancy for each
    /// category that produced one; the balance score needs at least two
    /// entries to say anything.
    pub fn analyze(
        &self,
        questions: &[Question],
        per_category_relevancy: &BTreeMap<QuestionCategory, f64>,
    ) -> GeneralizationReport {
        let mut specific_count = 0usize;
        let mut generalization_count = 0usize;
        let mut mixed_count = 0usize;
        for question in questions {
            match self.classify(&question.text) {
                QuestionStyle::Specific => specific_count += 1,
                QuestionStyle::Generalization => generalization_count += 1,
                QuestionStyle::Mixed => mixed_count += 1,
            }
        }

        let total = questions.len();
        let ratio = |count: usize| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            }
        };
        let specific_ratio = ratio(specific_count);
        let generalization_ratio = ratio(generalization_count);
        let mixed_ratio = ratio(mixed_count);

        GeneralizationReport {
            specific_count,
            generalization_count,
            mixed_count,
            specific_ratio,
            generalization_ratio,
            mixed_ratio,
            level: derive_level(specific_ratio, generalization_ratio, mixed_ratio),
            score: balance_score(per_category_relevancy),
        }
    }

    fn has_concrete_markers(&self, text: &str) -> bool {
        self.numeric.is_match(text)
            || self.error_code.is_match(text)
            || self.section_ref.is_match(text)
    }
}

impl Default for GeneralizationAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn has_abstraction_markers(text: &str) -> bool {
    let lower = text.to_lowercase();
    ABSTRACTION_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

fn derive_level(
    specific_ratio: f64,
    generalization_ratio: f64,
    mixed_ratio: f64,
) -> GeneralizationLevel {
    if generalization_ratio > 0.5 {
        GeneralizationLevel::High
    } else if mixed_ratio > 0.4 {
        GeneralizationLevel::Medium
    } else if specific_ratio > 0.6 {
        GeneralizationLevel::Low
    } else {
        GeneralizationLevel::Balanced
    }
}

/// Balance score from the spread of per-category average relevancy.
///
/// `1 − min(stddev / 0.5, 1)`: identical averages score 1.0, maximally
/// spread averages score 0.0. Fewer than two categories give no signal.
pub fn balance_score(per_category_relevancy: &BTreeMap<QuestionCategory, f64>) -> Option<f64> {
    if per_category_relevancy.len() < 2 {
        return None;
    }
    let values: Vec<f64> = per_category_relevancy.values().copied().collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let stddev = variance.sqrt();
    Some(1.0 - (stddev / 0.5).min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reference;
    use pretty_assertions::assert_eq;

    fn question(category: QuestionCategory, text: &str) -> Question {
        Question::new(category, text, Vec::<Reference>::new())
    }

    #[test]
    fn test_classify_concrete_question() {
        let analyzer = GeneralizationAnalyzer::new();
        assert_eq!(
            analyzer.classify("Which value does register 0x3F hold after reset?"),
            QuestionStyle::Specific
        );
        assert_eq!(
            analyzer.classify("Which firmware build fixed defect HW-1042?"),
            QuestionStyle::Specific
        );
    }

    #[test]
    fn test_classify_abstract_question() {
        let analyzer = GeneralizationAnalyzer::new();
        assert_eq!(
            analyzer.classify("What is the recovery procedure after a failed update?"),
            QuestionStyle::Generalization
        );
    }

    #[test]
    fn test_classify_mixed_question() {
        let analyzer = GeneralizationAnalyzer::new();
        assert_eq!(
            analyzer.classify("Why does step 3 of the recovery procedure fail with ERR-102?"),
            QuestionStyle::Mixed
        );
    }

    #[test]
    fn test_classify_without_markers_reads_as_generalization() {
        let analyzer = GeneralizationAnalyzer::new();
        assert_eq!(
            analyzer.classify("Summarize the troubleshooting guidance."),
            QuestionStyle::Generalization
        );
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(derive_level(0.3, 0.6, 0.1), GeneralizationLevel::High);
        assert_eq!(derive_level(0.2, 0.3, 0.5), GeneralizationLevel::Medium);
        assert_eq!(derive_level(0.7, 0.2, 0.1), GeneralizationLevel::Low);
        assert_eq!(derive_level(0.4, 0.4, 0.2), GeneralizationLevel::Balanced);
    }

    #[test]
    fn test_analyze_counts_and_ratios() {
        let analyzer = GeneralizationAnalyzer::new();
        let questions = vec![
            question(QuestionCategory::S1, "What is the purpose of the watchdog?"),
            question(QuestionCategory::S1, "Explain how the cache is invalidated."),
            question(QuestionCategory::S2, "What does error 404 mean in chapter 2?"),
            question(QuestionCategory::S3, "Why does build 1.4.2 reject the config?"),
        ];
        let report = analyzer.analyze(&questions, &BTreeMap::new());
        assert_eq!(report.generalization_count, 2);
        assert_eq!(report.specific_count, 1);
        assert_eq!(report.mixed_count, 1);
        assert_eq!(report.generalization_ratio, 0.5);
        assert_eq!(report.specific_ratio, 0.25);
        assert_eq!(report.level, GeneralizationLevel::Balanced);
        assert_eq!(report.score, None);
    }

    #[test]
    fn test_balance_score_extremes() {
        let mut even = BTreeMap::new();
        even.insert(QuestionCategory::S1, 0.8);
        even.insert(QuestionCategory::S2, 0.8);
        even.insert(QuestionCategory::S3, 0.8);
        assert!((balance_score(&even).unwrap() - 1.0).abs() < 1e-9);

        let mut spread = BTreeMap::new();
        spread.insert(QuestionCategory::S1, 0.0);
        spread.insert(QuestionCategory::S2, 1.0);
        assert!((balance_score(&spread).unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_balance_score_needs_two_categories() {
        assert_eq!(balance_score(&BTreeMap::new()), None);
        let mut single = BTreeMap::new();
        single.insert(QuestionCategory::S4, 0.9);
        assert_eq!(balance_score(&single), None);
    }
}
