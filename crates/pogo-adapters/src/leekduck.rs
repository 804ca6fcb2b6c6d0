use async_trait::async_trait;
use chrono::NaiveDate;
use pogo_core::datetext::{mentions_local_time, mentions_utc, parse_listing_date};
use pogo_core::{CandidatePage, DateWindow, RawEventFields};
use pogo_storage::PageFetcher;
use scraper::{ElementRef, Html};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dedup_by_url, element_text, select_all_texts, select_first_attr, select_first_text, selector,
    truncate_chars, AdapterError, ExtractionError, SourceAdapter, SourceConfig,
    DESCRIPTION_MAX_CHARS,
};

const EVENT_HOST: &str = "leekduck.com";
const START_DATE_ATTR: &str = "data-event-start-date";

#[derive(Debug, Clone)]
pub struct LeekDuckAdapter {
    config: SourceConfig,
}

impl LeekDuckAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// Event links on a hub page, dated and filtered to `window`.
    pub(crate) fn parse_hub(
        &self,
        hub_url: &str,
        markup: &str,
        window: &DateWindow,
    ) -> Result<Vec<CandidatePage>, ExtractionError> {
        let document = Html::parse_document(markup);
        let base = Url::parse(hub_url).ok();
        let link_sel = selector("a[href]")?;
        let heading_sel = selector(".event-item-title, h2, h3, h4, h5")?;

        let mut out = Vec::new();
        for anchor in document.select(&link_sel) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some((url, slug)) = event_link(base.as_ref(), href) else {
                continue;
            };

            let published_on = start_date_attr(&anchor)
                .or_else(|| parse_listing_date(&element_text(&anchor)))
                .unwrap_or(window.start);
            if !window.contains(published_on) {
                debug!(url = %url, date = %published_on, "hub link outside window");
                continue;
            }

            let title = anchor
                .select(&heading_sel)
                .next()
                .map(|h| element_text(&h))
                .filter(|t| !t.is_empty())
                .or_else(|| Some(element_text(&anchor)).filter(|t| !t.is_empty()))
                .unwrap_or(slug);
            out.push(CandidatePage {
                source_id: self.config.source_id.clone(),
                url,
                title,
                published_on,
            });
        }
        Ok(out)
    }
}

/// `https://leekduck.com/events/<slug>/` links only; returns the absolute URL and slug.
fn event_link(base: Option<&Url>, href: &str) -> Option<(String, String)> {
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    let host = url.host_str()?;
    if host != EVENT_HOST && !host.ends_with(&format!(".{EVENT_HOST}")) {
        return None;
    }
    let segments = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    match segments.as_slice() {
        ["events", slug] => {
            let slug = slug.to_string();
            let mut clean = url.clone();
            clean.set_query(None);
            clean.set_fragment(None);
            Some((clean.to_string(), slug))
        }
        _ => None,
    }
}

/// Start date from the anchor or the nearest ancestor carrying it.
fn start_date_attr(anchor: &ElementRef<'_>) -> Option<NaiveDate> {
    std::iter::once(*anchor)
        .chain(anchor.ancestors().filter_map(ElementRef::wrap))
        .find_map(|el| el.value().attr(START_DATE_ATTR))
        .and_then(|raw| {
            NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d")
                .ok()
                .or_else(|| parse_listing_date(raw))
        })
}

#[async_trait]
impl SourceAdapter for LeekDuckAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    async fn discover(
        &self,
        fetcher: &dyn PageFetcher,
        window: &DateWindow,
    ) -> Result<Vec<CandidatePage>, AdapterError> {
        let source_id = self.config.source_id.as_str();
        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        let mut reached_any = false;

        for hub_url in &self.config.listing_urls {
            let page = match fetcher.fetch(source_id, hub_url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source_id, error = %err, "hub fetch failed");
                    failures.push(err.to_string());
                    continue;
                }
            };
            reached_any = true;
            let markup = String::from_utf8_lossy(&page.body);
            let links = self.parse_hub(hub_url, &markup, window)?;
            debug!(source_id, hub = %hub_url, links = links.len(), "hub parsed");
            candidates.extend(links);
        }

        if !reached_any && !failures.is_empty() {
            return Err(AdapterError::Unreachable {
                source_id: source_id.to_string(),
                failures,
            });
        }

        let candidates = dedup_by_url(candidates);
        info!(source_id, candidates = candidates.len(), window = %window, "discovery finished");
        Ok(candidates)
    }

    fn extract(&self, markup: &str) -> Result<RawEventFields, ExtractionError> {
        let document = Html::parse_document(markup);

        let title = select_first_text(&document, "h1")?
            .or(select_first_attr(&document, r#"meta[property="og:title"]"#, "content")?)
            .ok_or(ExtractionError::MissingField { field: "title" })?;

        let date_start = select_first_text(&document, "#event-date-start")?;
        let time_start = select_first_text(&document, "#event-time-start")?;
        let date_end = select_first_text(&document, "#event-date-end")?;
        let time_end = select_first_text(&document, "#event-time-end")?;
        let Some(date_start) = date_start else {
            return Err(ExtractionError::MissingField {
                field: "schedule_text",
            });
        };

        let mut schedule = date_start.clone();
        if let Some(time) = &time_start {
            schedule.push(' ');
            schedule.push_str(time);
        }
        if date_end.is_some() || time_end.is_some() {
            schedule.push_str(" - ");
            schedule.push_str(&[date_end, time_end].into_iter().flatten().collect::<Vec<_>>().join(" "));
        }
        if let Some(hint) = time_zone_hint(&document)? {
            schedule.push(' ');
            schedule.push_str(hint);
        }

        let category_hints = select_all_texts(&document, ".event-type, .event-tag-badge")?;
        let description = select_all_texts(&document, ".event-description p, .page-content p")?
            .into_iter()
            .take(3)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(RawEventFields {
            title,
            published_on: parse_listing_date(&date_start),
            schedule_text: schedule,
            category_hints,
            description: (!description.is_empty())
                .then(|| truncate_chars(&description, DESCRIPTION_MAX_CHARS)),
            other_dates: Vec::new(),
        })
    }
}

/// Leek Duck prints "Local Time" or a UTC marker beside the start time.
fn time_zone_hint(document: &Html) -> Result<Option<&'static str>, ExtractionError> {
    let time_sel = selector("#event-time-start, #event-date-start")?;
    let context = document
        .select(&time_sel)
        .filter_map(|el| el.parent().and_then(ElementRef::wrap))
        .map(|parent| element_text(&parent))
        .collect::<Vec<_>>()
        .join(" ");
    Ok(if mentions_utc(&context) {
        Some("UTC")
    } else if mentions_local_time(&context) {
        Some("Local Time")
    } else {
        None
    })
}
