//! Structural chapter matching between retrieved answers and ground-truth
//! references.
//!
//! Matching is case-insensitive and ignores path separator formatting. When
//! both headings carry section numbering the numbering decides: `3.2`
//! matches `3.2`, and a retrieved `3` matches a referenced `3.2` because the
//! retrieved section contains the referenced one (the reverse does not).
//! Without numbering on both sides, the numbering-stripped heading text
//! decides, so `3.2.1 Setup` matches `Setup`. Malformed references are
//! non-matchable, never an error.

use regex::Regex;

use crate::types::{Reference, RetrievalRecord};

/// Compares retrieved answer locations against reference locations.
pub struct ChapterMatcher {
    numbering: Regex,
}

impl ChapterMatcher {
    pub fn new() -> Self {
        Self {
            numbering: Regex::new(r"^(\d+(?:\.\d+)*)\.?\s*").unwrap(),
        }
    }

    /// `chapter_match_accuracy` for one record: 1.0 when the answer chapter
    /// matches any reference entry, 0.0 when it matches none, `None` for a
    /// failed retrieval.
    pub fn chapter_accuracy(
        &self,
        record: &RetrievalRecord,
        references: &[Reference],
    ) -> Option<f64> {
        if !record.succeeded {
            return None;
        }
        let retrieved = Reference::parse(&record.answer_chapter);
        let hit = references
            .iter()
            .any(|r| self.location_matches(&retrieved, r));
        Some(if hit { 1.0 } else { 0.0 })
    }

    /// `chapter_match_recall` for one record: covered references over total
    /// references, `None` for failed retrievals or an empty reference list.
    pub fn chapter_recall(
        &self,
        record: &RetrievalRecord,
        references: &[Reference],
    ) -> Option<f64> {
        if !record.succeeded || references.is_empty() {
            return None;
        }
        let cited = self.cited_locations(record);
        let covered = references
            .iter()
            .filter(|r| cited.iter().any(|c| self.location_matches(c, r)))
            .count();
        Some((covered as f64 / references.len() as f64).clamp(0.0, 1.0))
    }

    /// Whether any of the top-`k` retrieved chunks lands on a reference.
    /// `None` when the record failed or the question has no references
    /// (no chapter signal, excluded from recall@k).
    pub fn hit_within_top_k(
        &self,
        record: &RetrievalRecord,
        references: &[Reference],
        k: usize,
    ) -> Option<bool> {
        if !record.succeeded || references.is_empty() {
            return None;
        }
        let hit = record.retrieved_chunks.iter().take(k).any(|chunk| {
            let location = Reference::new(chunk.source_document.clone(), chunk.heading.clone());
            references
                .iter()
                .any(|r| self.location_matches(&location, r))
        });
        Some(hit)
    }

    /// Whether a retrieved location satisfies one reference entry.
    ///
    /// A retrieved entry without a document part (`"Setup"` rather than
    /// `"docB|Setup"`) is matched on the heading alone, since some services
    /// cite bare headings.
    pub fn location_matches(&self, retrieved: &Reference, reference: &Reference) -> bool {
        if !reference.is_well_formed() {
            return false;
        }
        if retrieved.heading.is_empty() {
            return !retrieved.source_document.is_empty()
                && self.headings_match(&retrieved.source_document, &reference.heading);
        }
        normalize(&retrieved.source_document) == normalize(&reference.source_document)
            && self.headings_match(&retrieved.heading, &reference.heading)
    }

    fn headings_match(&self, retrieved: &str, reference: &str) -> bool {
        let retrieved = normalize(retrieved);
        let reference = normalize(reference);
        if retrieved.is_empty() || reference.is_empty() {
            return false;
        }
        if retrieved == reference {
            return true;
        }

        let retrieved_levels = self.heading_levels(&retrieved);
        let reference_levels = self.heading_levels(&reference);
        if !retrieved_levels.is_empty() && !reference_levels.is_empty() {
            // Numbering decides: equal sections match, and an ancestor
            // section contains the referenced one.
            return retrieved_levels == reference_levels
                || (retrieved_levels.len() < reference_levels.len()
                    && reference_levels[..retrieved_levels.len()] == retrieved_levels[..]);
        }

        let retrieved_text = self.strip_numbering(&retrieved);
        let reference_text = self.strip_numbering(&reference);
        !retrieved_text.is_empty() && retrieved_text == reference_text
    }

    /// Leading section numbering as level components (`"3.2.1 Setup"` ->
    /// `[3, 2, 1]`), empty when the heading has none.
    fn heading_levels(&self, normalized: &str) -> Vec<u32> {
        let Some(caps) = self.numbering.captures(normalized) else {
            return Vec::new();
        };
        caps[1]
            .split('.')
            .filter_map(|part| part.parse().ok())
            .collect()
    }

    fn strip_numbering(&self, normalized: &str) -> String {
        self.numbering.replace(normalized, "").trim().to_string()
    }

    /// Every location the record cites: the answer chapter plus all
    /// retrieved chunk locations.
    fn cited_locations(&self, record: &RetrievalRecord) -> Vec<Reference> {
        let mut locations = Vec::with_capacity(record.retrieved_chunks.len() + 1);
        if !record.answer_chapter.trim().is_empty() {
            locations.push(Reference::parse(&record.answer_chapter));
        }
        for chunk in &record.retrieved_chunks {
            locations.push(Reference::new(
                chunk.source_document.clone(),
                chunk.heading.clone(),
            ));
        }
        locations
    }
}

impl Default for ChapterMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase, fold path separators into spaces, and collapse whitespace.
fn normalize(raw: &str) -> String {
    let mut text = raw.to_lowercase();
    for separator in ['/', '\\', '>', '»'] {
        text = text.replace(separator, " ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
