//! Source adapter contracts + the Niantic News and Leek Duck adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pogo_core::{CandidatePage, DateWindow, RawEventFields};
use pogo_storage::PageFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod leekduck;
mod niantic;

pub use leekduck::LeekDuckAdapter;
pub use niantic::NianticNewsAdapter;

pub const CRATE_NAME: &str = "pogo-adapters";

/// Longest description kept from a page.
pub const DESCRIPTION_MAX_CHARS: usize = 1200;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no discovery endpoint of `{source_id}` could be reached: {failures:?}")]
    Unreachable {
        source_id: String,
        failures: Vec<String>,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("mandatory field `{field}` not found")]
    MissingField { field: &'static str },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Per-publisher discovery and extraction, driven uniformly by the builder.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;

    /// Candidate event pages for `window`; idempotent for the same window.
    async fn discover(
        &self,
        fetcher: &dyn PageFetcher,
        window: &DateWindow,
    ) -> Result<Vec<CandidatePage>, AdapterError>;

    /// Raw fields from one saved page. Optional fields may be empty.
    fn extract(&self, markup: &str) -> Result<RawEventFields, ExtractionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    NianticNews,
    LeekDuck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: AdapterKind,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default = "default_max_archive_pages")]
    pub max_archive_pages: usize,
}

fn default_max_archive_pages() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source_id: "niantic".to_string(),
                    display_name: "Niantic News".to_string(),
                    enabled: true,
                    kind: AdapterKind::NianticNews,
                    feed_url: Some("https://pokemongolive.com/news/?format=rss".to_string()),
                    listing_urls: vec!["https://pokemongolive.com/news/".to_string()],
                    max_archive_pages: default_max_archive_pages(),
                },
                SourceConfig {
                    source_id: "leekduck".to_string(),
                    display_name: "Leek Duck".to_string(),
                    enabled: true,
                    kind: AdapterKind::LeekDuck,
                    feed_url: None,
                    listing_urls: vec![
                        "https://leekduck.com/events/".to_string(),
                        "https://leekduck.com/calendar/".to_string(),
                    ],
                    max_archive_pages: 1,
                },
            ],
        }
    }
}

impl SourceRegistry {
    /// Reads a `sources.yaml` registry, falling back to the built-in sources.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn display_name<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.get(source_id)
            .map(|s| s.display_name.as_str())
            .unwrap_or(source_id)
    }
}

pub fn adapter_for_source(config: &SourceConfig) -> Box<dyn SourceAdapter> {
    match config.kind {
        AdapterKind::NianticNews => Box::new(NianticNewsAdapter::new(config.clone())),
        AdapterKind::LeekDuck => Box::new(LeekDuckAdapter::new(config.clone())),
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Joins text nodes with single spaces.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ExtractionError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .find_map(|n| text_or_none(element_text(&n))))
}

pub(crate) fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, ExtractionError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(element_text(&n)))
        .collect())
}

pub(crate) fn select_first_attr(
    document: &Html,
    css: &str,
    attr: &str,
) -> Result<Option<String>, ExtractionError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string())))
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Drops candidates whose URL was already seen, keeping the first.
pub(crate) fn dedup_by_url(candidates: Vec<CandidatePage>) -> Vec<CandidatePage> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.url.clone()))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_registry_has_both_sources() {
        let registry = SourceRegistry::default();
        let ids = registry.enabled().map(|s| s.source_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["niantic", "leekduck"]);
        assert_eq!(registry.display_name("leekduck"), "Leek Duck");
        assert_eq!(registry.display_name("unknown"), "unknown");
    }

    #[test]
    fn registry_yaml_round_trips_through_adapter_factory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source_id: leekduck\n    display_name: Leek Duck\n    enabled: true\n    kind: leek_duck\n    listing_urls: [\"https://leekduck.com/events/\"]\n",
        )
        .unwrap();
        let registry = SourceRegistry::load_or_default(&path).unwrap();
        assert_eq!(registry.sources.len(), 1);
        assert_eq!(registry.sources[0].max_archive_pages, 10);
        let adapter = adapter_for_source(&registry.sources[0]);
        assert_eq!(adapter.source_id(), "leekduck");
        assert_eq!(adapter.display_name(), "Leek Duck");
    }

    #[test]
    fn missing_registry_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let registry = SourceRegistry::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(registry, SourceRegistry::default());
    }
}
