//! Free-form date text helpers shared by the adapters and the normalizer.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use regex::Regex;

/// A calendar date found in prose, in text order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMention {
    pub date: NaiveDate,
    pub explicit_year: bool,
}

#[derive(Debug, Clone, Copy)]
struct RawMention {
    offset: usize,
    month: u32,
    day: u32,
    year: Option<i32>,
}

fn month_day_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sept?(?:ember)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s+(\d{1,2})(?:st|nd|rd|th)?\b(?:\s*-\s*(\d{1,2})(?:st|nd|rd|th)?\b)?(?:,?\s+(\d{4})\b)?",
        )
        .expect("month/day pattern compiles")
    })
}

fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("iso date pattern compiles")
    })
}

/// Replaces typographic dashes and non-breaking spaces with ASCII.
pub fn normalize_dashes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
            '\u{00a0}' | '\u{202f}' => ' ',
            other => other,
        })
        .collect()
}

pub fn month_number(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Year for a month mentioned without one, relative to a publication date.
///
/// Announcements talk about the near future or recent past, so a month more
/// than six months away from the reference belongs to the adjacent year.
pub fn infer_year(month: u32, reference: NaiveDate) -> i32 {
    let ref_month = reference.month() as i32;
    let month = month as i32;
    if month + 6 < ref_month {
        reference.year() + 1
    } else if month > ref_month + 6 {
        reference.year() - 1
    } else {
        reference.year()
    }
}

fn looks_like_clock_suffix(rest: &str) -> bool {
    let rest = rest.trim_start().to_ascii_lowercase();
    rest.starts_with(':')
        || rest.starts_with("a.m")
        || rest.starts_with("p.m")
        || rest.starts_with("am")
        || rest.starts_with("pm")
}

fn raw_mentions(text: &str) -> Vec<RawMention> {
    let mut out = Vec::new();

    for caps in month_day_regex().captures_iter(text) {
        let Some(month) = caps.get(1).and_then(|m| month_number(m.as_str())) else {
            continue;
        };
        let Some(day) = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        let offset = caps.get(0).map(|m| m.start()).unwrap_or_default();
        let year = caps.get(4).and_then(|m| m.as_str().parse::<i32>().ok());

        let second_day = caps.get(3).and_then(|m| {
            if looks_like_clock_suffix(&text[m.end()..]) {
                None
            } else {
                m.as_str().parse::<u32>().ok()
            }
        });

        out.push(RawMention {
            offset,
            month,
            day,
            year,
        });
        if let Some(second) = second_day {
            out.push(RawMention {
                offset: offset + 1,
                month,
                day: second,
                year,
            });
        }
    }

    for caps in iso_date_regex().captures_iter(text) {
        let parsed = (
            caps[1].parse::<i32>().ok(),
            caps[2].parse::<u32>().ok(),
            caps[3].parse::<u32>().ok(),
        );
        if let (Some(year), Some(month), Some(day)) = parsed {
            out.push(RawMention {
                offset: caps.get(0).map(|m| m.start()).unwrap_or_default(),
                month,
                day,
                year: Some(year),
            });
        }
    }

    out.sort_by_key(|m| m.offset);
    out
}

/// All dates mentioned in `text`, in order.
///
/// A mention without a year borrows the year of the next mention that has
/// one (stepping back a year when that would put it after its successor),
/// else the year inferred from `reference`. Mentions that cannot be dated
/// are dropped.
pub fn date_mentions(text: &str, reference: Option<NaiveDate>) -> Vec<DateMention> {
    let text = normalize_dashes(text);
    let raw = raw_mentions(&text);
    let mut resolved: Vec<Option<DateMention>> = vec![None; raw.len()];
    let mut next_explicit: Option<NaiveDate> = None;

    for (idx, mention) in raw.iter().enumerate().rev() {
        let entry = match mention.year {
            Some(year) => NaiveDate::from_ymd_opt(year, mention.month, mention.day).map(|date| {
                DateMention {
                    date,
                    explicit_year: true,
                }
            }),
            None => {
                let borrowed = next_explicit.and_then(|later| {
                    let same_year = NaiveDate::from_ymd_opt(later.year(), mention.month, mention.day)?;
                    if same_year > later {
                        NaiveDate::from_ymd_opt(later.year() - 1, mention.month, mention.day)
                    } else {
                        Some(same_year)
                    }
                });
                borrowed
                    .or_else(|| {
                        reference.and_then(|r| {
                            NaiveDate::from_ymd_opt(infer_year(mention.month, r), mention.month, mention.day)
                        })
                    })
                    .map(|date| DateMention {
                        date,
                        explicit_year: false,
                    })
            }
        };
        if let Some(found) = entry {
            if found.explicit_year {
                next_explicit = Some(found.date);
            }
        }
        resolved[idx] = entry;
    }

    resolved.into_iter().flatten().collect()
}

fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap])\.?\s?m\b\.?|\b(\d{1,2}):(\d{2})\b|\b(noon|midnight)\b",
        )
        .expect("clock pattern compiles")
    })
}

fn utc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(utc|gmt)\b").expect("utc pattern compiles"))
}

/// Clock times mentioned in `text`, in order (`2:00 p.m.`, `2 PM`, `14:00`, `noon`).
pub fn clock_times(text: &str) -> Vec<NaiveTime> {
    clock_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            if let Some(word) = caps.get(6) {
                return if word.as_str().eq_ignore_ascii_case("noon") {
                    NaiveTime::from_hms_opt(12, 0, 0)
                } else {
                    NaiveTime::from_hms_opt(0, 0, 0)
                };
            }
            if let Some(hour) = caps.get(1) {
                let hour = hour.as_str().parse::<u32>().ok()?;
                let minute = caps
                    .get(2)
                    .map(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(Some(0))?;
                if !(1..=12).contains(&hour) {
                    return None;
                }
                let pm = caps
                    .get(3)
                    .map(|m| m.as_str().eq_ignore_ascii_case("p"))
                    .unwrap_or(false);
                let hour24 = match (hour, pm) {
                    (12, false) => 0,
                    (12, true) => 12,
                    (h, true) => h + 12,
                    (h, false) => h,
                };
                return NaiveTime::from_hms_opt(hour24, minute, 0);
            }
            let hour = caps.get(4)?.as_str().parse::<u32>().ok()?;
            let minute = caps.get(5)?.as_str().parse::<u32>().ok()?;
            NaiveTime::from_hms_opt(hour, minute, 0)
        })
        .collect()
}

/// True when `text` names a month/day or ISO date, with or without a year.
pub fn mentions_date(text: &str) -> bool {
    !raw_mentions(&normalize_dashes(text)).is_empty()
}

pub fn mentions_utc(text: &str) -> bool {
    utc_regex().is_match(text)
}

pub fn mentions_local_time(text: &str) -> bool {
    text.to_ascii_lowercase().contains("local time")
}

/// Publication date from feed/listing text: RFC 2822, RFC 3339, ISO, or prose.
pub fn parse_listing_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    date_mentions(trimmed, None)
        .into_iter()
        .find(|m| m.explicit_year)
        .map(|m| m.date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn clock_times_in_prose() {
        assert_eq!(
            clock_times("Sunday, September 14, 2025, from 2:00 p.m. to 5:00 p.m. local time"),
            vec![hm(14, 0), hm(17, 0)]
        );
        assert_eq!(clock_times("6 PM - 7 PM"), vec![hm(18, 0), hm(19, 0)]);
        assert_eq!(clock_times("starts 12 a.m., ends at noon"), vec![hm(0, 0), hm(12, 0)]);
        assert_eq!(clock_times("runs 14:00 to 22:30 UTC"), vec![hm(14, 0), hm(22, 30)]);
        assert!(clock_times("September 14, 2025 is amazing").is_empty());
    }

    #[test]
    fn zone_markers() {
        assert!(mentions_utc("from 14:00 UTC"));
        assert!(mentions_utc("(GMT)"));
        assert!(!mentions_utc("outcome"));
        assert!(mentions_local_time("5 p.m. Local Time"));
    }

    #[test]
    fn listing_dates_in_common_shapes() {
        assert_eq!(
            parse_listing_date("Wed, 10 Sep 2025 17:00:00 +0000"),
            Some(date(2025, 9, 10))
        );
        assert_eq!(
            parse_listing_date("2025-09-10T17:00:00Z"),
            Some(date(2025, 9, 10))
        );
        assert_eq!(parse_listing_date("September 10, 2025"), Some(date(2025, 9, 10)));
        assert_eq!(parse_listing_date("Sept. 3 2025"), Some(date(2025, 9, 3)));
        assert_eq!(parse_listing_date("no date here"), None);
    }

    #[test]
    fn ranges_share_a_trailing_year() {
        let found = date_mentions("Monday, September 1 - Sunday, September 7, 2025", None);
        let dates: Vec<_> = found.iter().map(|m| m.date).collect();
        assert_eq!(dates, vec![date(2025, 9, 1), date(2025, 9, 7)]);
        assert!(!found[0].explicit_year);
    }

    #[test]
    fn compact_day_range_expands() {
        let dates: Vec<_> = date_mentions("September 14\u{2013}16, 2025", None)
            .into_iter()
            .map(|m| m.date)
            .collect();
        assert_eq!(dates, vec![date(2025, 9, 14), date(2025, 9, 16)]);
    }

    #[test]
    fn clock_after_dash_is_not_a_day() {
        let dates: Vec<_> = date_mentions("September 14 - 2:00 p.m.", Some(date(2025, 9, 1)))
            .into_iter()
            .map(|m| m.date)
            .collect();
        assert_eq!(dates, vec![date(2025, 9, 14)]);
    }

    #[test]
    fn year_boundary_steps_back() {
        let dates: Vec<_> = date_mentions("December 30 to January 2, 2026", None)
            .into_iter()
            .map(|m| m.date)
            .collect();
        assert_eq!(dates, vec![date(2025, 12, 30), date(2026, 1, 2)]);
    }

    #[test]
    fn missing_year_falls_back_to_reference() {
        let dates: Vec<_> = date_mentions("Saturday, January 4", Some(date(2025, 12, 20)))
            .into_iter()
            .map(|m| m.date)
            .collect();
        assert_eq!(dates, vec![date(2026, 1, 4)]);
        assert!(date_mentions("Saturday, January 4", None).is_empty());
    }

    #[test]
    fn date_presence_ignores_yearless_ambiguity() {
        assert!(mentions_date("Sunday, September 14"));
        assert!(mentions_date("2025-09-14"));
        assert!(!mentions_date("from 2:00 p.m. to 5:00 p.m."));
    }
}
