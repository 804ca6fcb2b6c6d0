use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDateTime, NaiveTime, Utc};
use pogo_core::datetext::{clock_times, date_mentions, mentions_utc, normalize_dashes};
use pogo_core::{
    Category, EmptyProvenance, EventRecord, EventTiming, Provenance, RawEventFields, TimingError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("no date found in schedule text `{0}`")]
    NoDate(String),
    #[error("empty title")]
    EmptyTitle,
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Provenance(#[from] EmptyProvenance),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: Category,
    pub keywords: Vec<String>,
}

/// Ordered keyword rules; the first rule with a hit wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        let rule = |category, keywords: &[&str]| CategoryRule {
            category,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule(Category::CommunityDay, &["community day"]),
                rule(Category::RaidMega, &["raid hour", "raid", "mega", "legendary"]),
                rule(Category::SpotlightHour, &["spotlight hour"]),
                rule(
                    Category::Research,
                    &["timed research", "field research", "research"],
                ),
                rule(Category::Season, &["season"]),
            ],
        }
    }
}

impl CategoryRules {
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_workspace_root(root: impl AsRef<Path>) -> Result<Self> {
        Self::load_or_default(root.as_ref().join("rules").join("categories.yaml"))
    }

    /// Title first, then the page's category hints; `Other` when nothing matches.
    pub fn classify(&self, title: &str, hints: &[String]) -> Category {
        let title = title.to_lowercase();
        let hints = hints.join(" ").to_lowercase();
        self.first_match(&title)
            .or_else(|| self.first_match(&hints))
            .unwrap_or(Category::Other)
    }

    fn first_match(&self, haystack: &str) -> Option<Category> {
        if haystack.trim().is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| haystack.contains(&k.to_lowercase()))
            })
            .map(|rule| rule.category)
    }
}

/// Turns extracted page fields into a canonical [`EventRecord`].
///
/// The first date mentioned starts the event and the last one ends it; the
/// first clock time is the start time and the second the end time. Text
/// naming UTC/GMT yields a fixed window, anything else a local window that
/// repeats in every region. Without a clock time the event is all-day.
pub fn normalize(
    raw: &RawEventFields,
    provenance: Provenance,
    first_seen: DateTime<Utc>,
    rules: &CategoryRules,
) -> Result<EventRecord, NormalizationError> {
    let title = raw.title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        return Err(NormalizationError::EmptyTitle);
    }

    let text = normalize_dashes(&raw.schedule_text);
    let reference = raw.published_on.unwrap_or_else(|| first_seen.date_naive());
    let dates = date_mentions(&text, Some(reference));
    let Some(first) = dates.first() else {
        return Err(NormalizationError::NoDate(raw.schedule_text.clone()));
    };
    let start_date = first.date;
    let end_date = dates
        .iter()
        .map(|d| d.date)
        .filter(|d| *d >= start_date)
        .last()
        .unwrap_or(start_date);
    let times = clock_times(&text);

    let timing = match times.as_slice() {
        [] => {
            let start = start_date.and_time(NaiveTime::default());
            let end = (end_date > start_date).then(|| end_date.and_time(NaiveTime::default()));
            EventTiming::local(start, end, true)?
        }
        [start_time, rest @ ..] => {
            let start = start_date.and_time(*start_time);
            let end = match rest.first() {
                Some(end_time) => Some(roll_past_midnight(start, end_date.and_time(*end_time))),
                // a later end date without its own time closes at the end of that day
                None if end_date > start_date => end_date.and_hms_opt(23, 59, 0),
                None => None,
            };
            if mentions_utc(&text) {
                EventTiming::fixed_utc(start.and_utc(), end.map(|e| e.and_utc()))?
            } else {
                EventTiming::local(start, end, false)?
            }
        }
    };

    let category = rules.classify(&title, &raw.category_hints);
    let mut record = EventRecord::new(
        title,
        category,
        timing,
        BTreeSet::from([provenance]),
        first_seen,
    )?;
    record.summary = raw.description.clone().filter(|d| !d.trim().is_empty());
    for line in &raw.other_dates {
        record.push_note(format!("also mentions: {}", line.trim()));
    }
    Ok(record)
}

/// `8 p.m. to 1 a.m.` on one date ends on the following day.
fn roll_past_midnight(start: NaiveDateTime, end: NaiveDateTime) -> NaiveDateTime {
    if end < start && end.date() == start.date() {
        end.checked_add_days(Days::new(1)).unwrap_or(end)
    } else {
        end
    }
}
