use std::collections::BTreeSet;

use chrono::Duration;
use pogo_core::{EventRecord, EventTiming};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, warn};

use crate::CompileFailure;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub title_match_threshold: f64,
    pub review_threshold: f64,
    pub fixed_window_tolerance_hours: i64,
    pub filler_words: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            title_match_threshold: 0.93,
            review_threshold: 0.85,
            fixed_window_tolerance_hours: 6,
            filler_words: [
                "the", "event", "events", "pokemon", "pokémon", "go", "and", "a", "an", "of",
            ]
            .iter()
            .map(|w| w.to_string())
            .collect(),
        }
    }
}

impl MergeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            title_match_threshold: env_parse("POGO_MERGE_TITLE_THRESHOLD")
                .unwrap_or(defaults.title_match_threshold),
            review_threshold: env_parse("POGO_MERGE_REVIEW_THRESHOLD")
                .unwrap_or(defaults.review_threshold),
            fixed_window_tolerance_hours: env_parse("POGO_MERGE_TOLERANCE_HOURS")
                .unwrap_or(defaults.fixed_window_tolerance_hours),
            filler_words: defaults.filler_words,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Two records that look alike but were not folded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReviewItem {
    pub kept_title: String,
    pub other_title: String,
    pub kept_provenance: Vec<String>,
    pub other_provenance: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergedDigest {
    pub records: Vec<EventRecord>,
    /// Records handed to the merger, before folding.
    pub input_records: usize,
    pub review: Vec<MergeReviewItem>,
    pub failures: Vec<CompileFailure>,
}

pub struct Merger {
    config: MergeConfig,
}

impl Merger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Case-folded, punctuation and filler stripped, tokens sorted.
    pub fn normalize_title(&self, title: &str) -> String {
        let lowered = title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>();
        let mut tokens = lowered
            .split_whitespace()
            .filter(|t| !self.config.filler_words.iter().any(|w| w == t))
            .filter(|t| !is_year(t))
            .collect::<Vec<_>>();
        tokens.sort_unstable();
        tokens.join(" ")
    }

    pub fn title_score(&self, a: &str, b: &str) -> f64 {
        let (na, nb) = (self.normalize_title(a), self.normalize_title(b));
        if na.is_empty() || nb.is_empty() {
            return jaro_winkler(&a.trim().to_lowercase(), &b.trim().to_lowercase());
        }
        jaro_winkler(&na, &nb)
    }

    fn starts_close(&self, a: &EventTiming, b: &EventTiming) -> bool {
        match (a, b) {
            (
                EventTiming::FixedUtcWindow { start: sa, .. },
                EventTiming::FixedUtcWindow { start: sb, .. },
            ) => (*sa - *sb).abs() <= Duration::hours(self.config.fixed_window_tolerance_hours),
            _ => a.start_date() == b.start_date(),
        }
    }

    fn comparable(&self, a: &EventRecord, b: &EventRecord) -> bool {
        a.category == b.category && self.starts_close(&a.timing, &b.timing)
    }

    /// Folds records describing the same happening and flags near-matches.
    ///
    /// Records are visited by `first_seen`, so the record kept for a group is
    /// always the earliest seen one. Output is in digest order.
    pub fn merge(&self, mut records: Vec<EventRecord>) -> MergedDigest {
        let input_records = records.len();
        records.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.digest_cmp(b)));

        let mut merged: Vec<EventRecord> = Vec::with_capacity(records.len());
        let mut review = Vec::new();
        for incoming in records {
            let target = merged.iter().position(|kept| self.same_event(kept, &incoming));
            if let Some(idx) = target {
                debug!(kept = %merged[idx].title, folded = %incoming.title, "records folded");
                fold(&mut merged[idx], incoming);
                continue;
            }

            let mut incoming = incoming;
            for kept in merged.iter_mut() {
                if !self.comparable(kept, &incoming) {
                    continue;
                }
                let score = self.title_score(&kept.title, &incoming.title);
                if score < self.config.review_threshold {
                    continue;
                }
                let item = MergeReviewItem {
                    kept_title: kept.title.clone(),
                    other_title: incoming.title.clone(),
                    kept_provenance: provenance_keys(kept),
                    other_provenance: provenance_keys(&incoming),
                    confidence_score: score,
                };
                warn!(
                    kept = %item.kept_title,
                    other = %item.other_title,
                    score,
                    "possible duplicate left unmerged"
                );
                kept.push_note(format!("possible duplicate of \"{}\"", incoming.title));
                incoming.push_note(format!("possible duplicate of \"{}\"", kept.title));
                review.push(item);
            }
            merged.push(incoming);
        }

        merged.sort_by(EventRecord::digest_cmp);
        MergedDigest {
            records: merged,
            input_records,
            review,
            failures: Vec::new(),
        }
    }

    fn same_event(&self, kept: &EventRecord, incoming: &EventRecord) -> bool {
        let kept_keys = provenance_keys(kept).into_iter().collect::<BTreeSet<_>>();
        if provenance_keys(incoming).iter().any(|k| kept_keys.contains(k)) {
            return true;
        }
        kept.source_ids().is_disjoint(&incoming.source_ids())
            && self.comparable(kept, incoming)
            && self.title_score(&kept.title, &incoming.title) >= self.config.title_match_threshold
    }
}

fn is_year(token: &str) -> bool {
    token.len() == 4
        && token.chars().all(|c| c.is_ascii_digit())
        && (token.starts_with("19") || token.starts_with("20"))
}

fn provenance_keys(record: &EventRecord) -> Vec<String> {
    record.provenance.iter().map(|p| p.key()).collect()
}

fn fold(kept: &mut EventRecord, other: EventRecord) {
    if other.timing.start_key() != kept.timing.start_key() {
        let sources = other.source_ids().into_iter().collect::<Vec<_>>().join(", ");
        kept.push_note(format!(
            "{sources} lists a start of {}",
            other.timing.start_key().format("%Y-%m-%d %H:%M")
        ));
    }
    if other.disposition() != kept.disposition() {
        kept.push_note(format!(
            "sources disagree on time zone handling ({} vs {})",
            kept.disposition().label(),
            other.disposition().label()
        ));
    }
    kept.timing.fill_missing_end(&other.timing);
    if kept.summary.is_none() {
        kept.summary = other.summary;
    }
    for note in other.notes {
        kept.push_note(note);
    }
    kept.provenance.extend(other.provenance);
}
