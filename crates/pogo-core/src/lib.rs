//! Core domain model and provenance types for the event library.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod datetext;

pub const CRATE_NAME: &str = "pogo-core";

pub const SLUG_MAX_LEN: usize = 120;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid date `{0}` (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("invalid month `{0}` (expected YYYY-MM)")]
    InvalidMonth(String),
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive range of calendar dates a run is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// First through last day of a `YYYY-MM` month.
    pub fn month(spec: &str) -> Result<Self, WindowError> {
        let start = NaiveDate::parse_from_str(&format!("{}-01", spec.trim()), "%Y-%m-%d")
            .map_err(|_| WindowError::InvalidMonth(spec.to_string()))?;
        let next = start
            .with_day(28)
            .and_then(|d| d.checked_add_days(Days::new(4)))
            .and_then(|d| d.with_day(1))
            .ok_or_else(|| WindowError::InvalidMonth(spec.to_string()))?;
        let end = next.pred_opt().ok_or_else(|| WindowError::InvalidMonth(spec.to_string()))?;
        Ok(Self { start, end })
    }

    pub fn from_bounds(start: &str, end: &str) -> Result<Self, WindowError> {
        Self::new(parse_iso_date(start)?, parse_iso_date(end)?)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl FromStr for DateWindow {
    type Err = WindowError;

    /// Accepts `YYYY-MM` or `YYYY-MM-DD..YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("..") {
            Some((start, end)) => Self::from_bounds(start, end),
            None => Self::month(s),
        }
    }
}

fn parse_iso_date(text: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| WindowError::InvalidDate(text.to_string()))
}

/// Lowercased, dash-joined, `[a-z0-9-]` only; never empty.
pub fn safe_slug(text: &str, max_len: usize) -> String {
    let collapsed = text
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let filtered = collapsed
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let truncated: String = filtered.chars().take(max_len).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated.to_string()
    }
}

/// Dedup key for a page within one source: `<date>_<title-slug>`.
pub fn slug_for(date: NaiveDate, title: &str) -> String {
    format!("{}_{}", date.format("%Y-%m-%d"), safe_slug(title, SLUG_MAX_LEN))
}

/// One page surfaced by an adapter's discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePage {
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub published_on: NaiveDate,
}

impl CandidatePage {
    pub fn slug(&self) -> String {
        let title = if self.title.trim().is_empty() {
            self.url.as_str()
        } else {
            self.title.as_str()
        };
        slug_for(self.published_on, title)
    }
}

/// HTTP cache validators sent back when a known page is fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageValidators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl PageValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Persisted catalog row for one discovered event page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryIndexEntry {
    pub slug: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub published_on: Option<NaiveDate>,
    pub snapshot_path: String,
    pub first_seen: DateTime<Utc>,
    pub last_fetched: DateTime<Utc>,
    pub fingerprint: String,
    #[serde(default)]
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "PageValidators::is_empty")]
    pub validators: PageValidators,
}

impl LibraryIndexEntry {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            source_id: self.source_id.clone(),
            slug: self.slug.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// One `{source, slug}` contribution to an event record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub slug: String,
    pub url: String,
}

impl Provenance {
    pub fn key(&self) -> String {
        format!("{}:{}", self.source_id, self.slug)
    }
}

/// Loosely structured fields pulled out of a page by a source adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventFields {
    pub title: String,
    pub schedule_text: String,
    pub published_on: Option<NaiveDate>,
    pub category_hints: Vec<String>,
    pub description: Option<String>,
    /// Dated lines outside the event's own schedule (ticket sales, deadlines).
    #[serde(default)]
    pub other_dates: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Category {
    #[serde(rename = "Community Day")]
    CommunityDay,
    #[serde(rename = "Raid/Mega")]
    RaidMega,
    #[serde(rename = "Spotlight Hour")]
    SpotlightHour,
    #[serde(rename = "Research")]
    Research,
    #[serde(rename = "Season")]
    Season,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::CommunityDay,
        Category::RaidMega,
        Category::SpotlightHour,
        Category::Research,
        Category::Season,
        Category::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Category::CommunityDay => "Community Day",
            Category::RaidMega => "Raid/Mega",
            Category::SpotlightHour => "Spotlight Hour",
            Category::Research => "Research",
            Category::Season => "Season",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    /// Same wall-clock window observed in every region.
    LocalRepeatsGlobally,
    /// One absolute window shared worldwide.
    FixedUtcWindow,
}

impl Disposition {
    pub fn label(self) -> &'static str {
        match self {
            Disposition::LocalRepeatsGlobally => "local-repeats-globally",
            Disposition::FixedUtcWindow => "fixed-UTC-window",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimingError {
    #[error("event end {end} precedes start {start}")]
    EndBeforeStart { start: String, end: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "kebab-case")]
pub enum EventTiming {
    LocalRepeatsGlobally {
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        all_day: bool,
    },
    FixedUtcWindow {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
}

impl EventTiming {
    pub fn local(
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        all_day: bool,
    ) -> Result<Self, TimingError> {
        if let Some(end) = end {
            if end < start {
                return Err(TimingError::EndBeforeStart {
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
        }
        Ok(EventTiming::LocalRepeatsGlobally {
            start,
            end,
            all_day,
        })
    }

    pub fn fixed_utc(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<Self, TimingError> {
        if let Some(end) = end {
            if end < start {
                return Err(TimingError::EndBeforeStart {
                    start: start.to_rfc3339(),
                    end: end.to_rfc3339(),
                });
            }
        }
        Ok(EventTiming::FixedUtcWindow { start, end })
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            EventTiming::LocalRepeatsGlobally { .. } => Disposition::LocalRepeatsGlobally,
            EventTiming::FixedUtcWindow { .. } => Disposition::FixedUtcWindow,
        }
    }

    /// Ordering instant: wall-clock for local windows, UTC for fixed ones.
    pub fn start_key(&self) -> NaiveDateTime {
        match self {
            EventTiming::LocalRepeatsGlobally { start, .. } => *start,
            EventTiming::FixedUtcWindow { start, .. } => start.naive_utc(),
        }
    }

    pub fn end_key(&self) -> Option<NaiveDateTime> {
        match self {
            EventTiming::LocalRepeatsGlobally { end, .. } => *end,
            EventTiming::FixedUtcWindow { end, .. } => end.map(|e| e.naive_utc()),
        }
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_key().date()
    }

    pub fn has_end(&self) -> bool {
        self.end_key().is_some()
    }

    /// Copies `other`'s end when this timing has none and the dispositions agree.
    pub fn fill_missing_end(&mut self, other: &EventTiming) {
        match (self, other) {
            (
                EventTiming::LocalRepeatsGlobally { start, end, .. },
                EventTiming::LocalRepeatsGlobally { end: Some(theirs), .. },
            ) if end.is_none() && *theirs >= *start => *end = Some(*theirs),
            (
                EventTiming::FixedUtcWindow { start, end },
                EventTiming::FixedUtcWindow { end: Some(theirs), .. },
            ) if end.is_none() && *theirs >= *start => *end = Some(*theirs),
            _ => {}
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event record `{0}` has no provenance")]
pub struct EmptyProvenance(pub String);

/// Canonical, normalized event produced by the digest compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub title: String,
    pub category: Category,
    pub timing: EventTiming,
    pub provenance: BTreeSet<Provenance>,
    pub notes: Vec<String>,
    pub first_seen: DateTime<Utc>,
    /// Leading description prose from the page.
    #[serde(default)]
    pub summary: Option<String>,
}

impl EventRecord {
    pub fn new(
        title: impl Into<String>,
        category: Category,
        timing: EventTiming,
        provenance: BTreeSet<Provenance>,
        first_seen: DateTime<Utc>,
    ) -> Result<Self, EmptyProvenance> {
        let title = title.into();
        if provenance.is_empty() {
            return Err(EmptyProvenance(title));
        }
        Ok(Self {
            title,
            category,
            timing,
            provenance,
            notes: Vec::new(),
            first_seen,
            summary: None,
        })
    }

    pub fn disposition(&self) -> Disposition {
        self.timing.disposition()
    }

    pub fn source_ids(&self) -> BTreeSet<&str> {
        self.provenance.iter().map(|p| p.source_id.as_str()).collect()
    }

    pub fn push_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !note.trim().is_empty() && !self.notes.iter().any(|n| n == &note) {
            self.notes.push(note);
        }
    }

    /// Digest order: start, then category, then title.
    pub fn digest_cmp(&self, other: &Self) -> Ordering {
        self.timing
            .start_key()
            .cmp(&other.timing.start_key())
            .then_with(|| self.category.cmp(&other.category))
            .then_with(|| self.title.cmp(&other.title))
    }

    /// Stable identifier derived from the provenance keys.
    pub fn stable_id(&self) -> Uuid {
        let keys = self
            .provenance
            .iter()
            .map(Provenance::key)
            .collect::<Vec<_>>()
            .join("|");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, keys.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_window_covers_whole_month() {
        let w = DateWindow::month("2025-09").unwrap();
        assert_eq!(w.start, date(2025, 9, 1));
        assert_eq!(w.end, date(2025, 9, 30));

        let feb = DateWindow::month("2024-02").unwrap();
        assert_eq!(feb.end, date(2024, 2, 29));

        let dec: DateWindow = "2025-12".parse().unwrap();
        assert_eq!(dec.end, date(2025, 12, 31));
    }

    #[test]
    fn explicit_window_rejects_inverted_bounds() {
        let w: DateWindow = "2025-09-01..2025-09-30".parse().unwrap();
        assert!(w.contains(date(2025, 9, 30)));
        assert!(!w.contains(date(2025, 10, 1)));
        assert!(matches!(
            DateWindow::from_bounds("2025-10-01", "2025-09-01"),
            Err(WindowError::Inverted { .. })
        ));
        assert!(matches!(
            DateWindow::month("2025-13"),
            Err(WindowError::InvalidMonth(_))
        ));
    }

    #[test]
    fn slugs_are_stable_and_filesystem_safe() {
        assert_eq!(
            slug_for(date(2025, 9, 10), "Community Day: Solosis!"),
            "2025-09-10_community-day-solosis"
        );
        assert_eq!(safe_slug("  Raid Hour -- Mega   Latias ", 120), "raid-hour-mega-latias");
        assert_eq!(safe_slug("???", 120), "untitled");
        assert_eq!(safe_slug("abcdef", 3), "abc");
    }

    #[test]
    fn candidate_slug_ignores_trailing_whitespace() {
        let a = CandidatePage {
            source_id: "niantic".into(),
            url: "https://example.test/a".into(),
            title: "Spotlight Hour ".into(),
            published_on: date(2025, 9, 2),
        };
        let mut b = a.clone();
        b.title = "Spotlight Hour".into();
        assert_eq!(a.slug(), b.slug());
    }

    #[test]
    fn timing_rejects_end_before_start() {
        let start = date(2025, 9, 14).and_hms_opt(14, 0, 0).unwrap();
        let end = date(2025, 9, 14).and_hms_opt(13, 0, 0).unwrap();
        assert!(EventTiming::local(start, Some(end), false).is_err());
        let utc_start = Utc.from_utc_datetime(&start);
        assert!(EventTiming::fixed_utc(utc_start, Some(utc_start)).is_ok());
    }

    #[test]
    fn record_requires_provenance_and_dedups_notes() {
        let timing = EventTiming::local(date(2025, 9, 14).and_hms_opt(14, 0, 0).unwrap(), None, false)
            .unwrap();
        let seen = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).single().unwrap();
        assert!(EventRecord::new("x", Category::Other, timing.clone(), BTreeSet::new(), seen).is_err());

        let mut prov = BTreeSet::new();
        prov.insert(Provenance {
            source_id: "leekduck".into(),
            slug: "2025-09-14_x".into(),
            url: "https://leekduck.com/events/x/".into(),
        });
        let mut rec = EventRecord::new("x", Category::Other, timing, prov, seen).unwrap();
        rec.push_note("bonus");
        rec.push_note("bonus");
        rec.push_note("  ");
        assert_eq!(rec.notes, vec!["bonus".to_string()]);
    }

    #[test]
    fn timing_serializes_with_disposition_tag() {
        let timing = EventTiming::fixed_utc(
            Utc.with_ymd_and_hms(2025, 9, 20, 14, 0, 0).single().unwrap(),
            None,
        )
        .unwrap();
        let json = serde_json::to_value(&timing).unwrap();
        assert_eq!(json["disposition"], "fixed-utc-window");
    }

    #[test]
    fn index_entries_without_validators_still_load() {
        let json = serde_json::json!({
            "slug": "2025-09-14_community-day-solosis",
            "source_id": "niantic",
            "url": "https://pokemongolive.com/news/cd-solosis",
            "title": "Community Day: Solosis",
            "published_on": "2025-09-10",
            "snapshot_path": "niantic/2025-09-14_community-day-solosis.html",
            "first_seen": "2025-09-01T06:00:00Z",
            "last_fetched": "2025-09-01T06:00:00Z",
            "fingerprint": "ab"
        });
        let entry: LibraryIndexEntry = serde_json::from_value(json).unwrap();
        assert!(entry.validators.is_empty());
        assert!(serde_json::to_value(&entry).unwrap().get("validators").is_none());
    }
}
