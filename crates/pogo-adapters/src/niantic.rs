use async_trait::async_trait;
use chrono::NaiveDate;
use pogo_core::datetext::{clock_times, mentions_date, parse_listing_date};
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

const CARD_CLASS_HINTS: [&str; 4] = ["post", "article", "card", "list"];

/// One parsed archive listing page.
#[derive(Debug, Clone, Default)]
pub(crate) struct ListingPage {
    pub candidates: Vec<CandidatePage>,
    pub dated_cards: usize,
    pub newest: Option<NaiveDate>,
    pub has_next: bool,
}

#[derive(Debug, Clone)]
pub struct NianticNewsAdapter {
    config: SourceConfig,
}

impl NianticNewsAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// `news/` for page 0, then `news/?page=N`.
    pub fn archive_page_url(base: &str, page: usize) -> String {
        if page == 0 {
            base.to_string()
        } else if base.contains('?') {
            format!("{base}&page={page}")
        } else {
            format!("{base}?page={page}")
        }
    }

    /// Feed items published inside `window`. Accepts RSS `item` and Atom `entry`.
    pub(crate) fn parse_feed(
        &self,
        xml: &str,
        window: &DateWindow,
    ) -> Result<Vec<CandidatePage>, roxmltree::Error> {
        let doc = roxmltree::Document::parse(xml)?;
        let mut out = Vec::new();
        for item in doc
            .descendants()
            .filter(|n| n.has_tag_name("item") || n.has_tag_name("entry"))
        {
            let child_text = |name: &str| {
                item.children()
                    .find(|c| c.has_tag_name(name))
                    .and_then(|c| c.text())
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
            };
            let link = child_text("link").map(str::to_string).or_else(|| {
                item.children()
                    .find(|c| c.has_tag_name("link"))
                    .and_then(|c| c.attribute("href"))
                    .map(str::to_string)
            });
            let published = child_text("pubDate")
                .or_else(|| child_text("published"))
                .or_else(|| child_text("updated"))
                .and_then(parse_listing_date);

            let (Some(url), Some(published_on)) = (link, published) else {
                debug!(source_id = %self.config.source_id, "feed item without link or date skipped");
                continue;
            };
            if !window.contains(published_on) {
                continue;
            }
            out.push(CandidatePage {
                source_id: self.config.source_id.clone(),
                url,
                title: child_text("title").unwrap_or_default().to_string(),
                published_on,
            });
        }
        Ok(out)
    }

    pub(crate) fn parse_listing(
        &self,
        page_url: &str,
        next_page_url: &str,
        markup: &str,
        window: &DateWindow,
    ) -> Result<ListingPage, ExtractionError> {
        let document = Html::parse_document(markup);
        let base = Url::parse(page_url).ok();
        let cards_sel = selector("article, div")?;
        let link_sel = selector("a[href]")?;
        let heading_sel = selector("h2, h3")?;
        let time_sel = selector("time")?;

        let mut listing = ListingPage::default();
        for card in document.select(&cards_sel).filter(|el| is_card(el)) {
            // Wrapper containers also match the class hints; only leaf cards carry one post.
            let has_nested_card = card
                .descendants()
                .skip(1)
                .filter_map(ElementRef::wrap)
                .any(|el| is_card(&el));
            if has_nested_card {
                continue;
            }
            let Some(anchor) = card.select(&link_sel).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let url = resolve(base.as_ref(), href);

            let time = card.select(&time_sel).next();
            let published = time
                .and_then(|t| t.value().attr("datetime"))
                .and_then(parse_listing_date)
                .or_else(|| time.and_then(|t| parse_listing_date(&element_text(&t))))
                .or_else(|| parse_listing_date(&element_text(&card)));
            let Some(published_on) = published else {
                continue;
            };

            listing.dated_cards += 1;
            listing.newest = listing.newest.max(Some(published_on));
            if !window.contains(published_on) {
                continue;
            }

            let title = card
                .select(&heading_sel)
                .next()
                .map(|h| element_text(&h))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(&anchor));
            listing.candidates.push(CandidatePage {
                source_id: self.config.source_id.clone(),
                url,
                title,
                published_on,
            });
        }

        listing.has_next = document.select(&link_sel).any(|a| {
            let rel_next = a
                .value()
                .attr("rel")
                .map(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("next")))
                .unwrap_or(false);
            rel_next
                || a.value()
                    .attr("href")
                    .map(|href| resolve(base.as_ref(), href) == next_page_url)
                    .unwrap_or(false)
        });
        Ok(listing)
    }
}

fn is_card(el: &ElementRef<'_>) -> bool {
    el.value()
        .attr("class")
        .map(|class| {
            let class = class.to_ascii_lowercase();
            CARD_CLASS_HINTS.iter().any(|hint| class.contains(hint))
        })
        .unwrap_or(false)
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

#[async_trait]
impl SourceAdapter for NianticNewsAdapter {
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

        if let Some(feed_url) = &self.config.feed_url {
            match fetcher.fetch(source_id, feed_url).await {
                Ok(page) => {
                    reached_any = true;
                    let xml = String::from_utf8_lossy(&page.body);
                    match self.parse_feed(&xml, window) {
                        Ok(items) => {
                            debug!(source_id, items = items.len(), "feed parsed");
                            candidates.extend(items);
                        }
                        Err(err) => warn!(source_id, url = %feed_url, error = %err, "feed unparseable"),
                    }
                }
                Err(err) => {
                    warn!(source_id, error = %err, "feed fetch failed");
                    failures.push(err.to_string());
                }
            }
        }

        for base in &self.config.listing_urls {
            for page_no in 0..self.config.max_archive_pages {
                let page_url = Self::archive_page_url(base, page_no);
                let next_url = Self::archive_page_url(base, page_no + 1);
                let page = match fetcher.fetch(source_id, &page_url).await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(source_id, error = %err, "archive walk stopped on fetch failure");
                        failures.push(err.to_string());
                        break;
                    }
                };
                reached_any = true;
                let markup = String::from_utf8_lossy(&page.body);
                let listing = self.parse_listing(&page_url, &next_url, &markup, window)?;
                debug!(
                    source_id,
                    page = page_no,
                    dated_cards = listing.dated_cards,
                    in_window = listing.candidates.len(),
                    "archive page parsed"
                );
                candidates.extend(listing.candidates);

                if listing.dated_cards == 0 || !listing.has_next {
                    break;
                }
                if listing.newest.map(|n| n < window.start).unwrap_or(false) {
                    break;
                }
            }
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

        let published_on = select_first_attr(&document, "time[datetime]", "datetime")?
            .as_deref()
            .and_then(parse_listing_date)
            .or(select_first_attr(
                &document,
                r#"meta[property="article:published_time"]"#,
                "content",
            )?
            .as_deref()
            .and_then(parse_listing_date));

        let paragraphs = select_all_texts(&document, "article p, main p")?;
        let lead = paragraphs
            .iter()
            .position(|p| mentions_date(p))
            .ok_or(ExtractionError::MissingField {
                field: "schedule_text",
            })?;
        let mut schedule_lines = vec![paragraphs[lead].clone()];
        // a bare date line may carry its time range on the next line
        if clock_times(&paragraphs[lead]).is_empty() {
            if let Some(times) = paragraphs
                .get(lead + 1)
                .filter(|p| !mentions_date(p) && !clock_times(p).is_empty())
            {
                schedule_lines.push(times.clone());
            }
        }
        let other_dates = paragraphs
            .iter()
            .skip(lead + schedule_lines.len())
            .filter(|p| mentions_date(p))
            .cloned()
            .collect::<Vec<_>>();

        let category_hints = select_all_texts(&document, ".tags a, .tag, [rel=tag]")?;
        let description = paragraphs
            .iter()
            .filter(|p| !schedule_lines.contains(p) && !other_dates.contains(p))
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(RawEventFields {
            title,
            schedule_text: schedule_lines.join("\n"),
            published_on,
            category_hints,
            description: (!description.is_empty())
                .then(|| truncate_chars(&description, DESCRIPTION_MAX_CHARS)),
            other_dates,
        })
    }
}
