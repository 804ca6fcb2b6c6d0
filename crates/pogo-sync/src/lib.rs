//! Library Builder: discover, fetch, fingerprint, and upsert event pages.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pogo_adapters::{adapter_for_source, SourceRegistry};
use pogo_core::{CandidatePage, DateWindow, PageValidators, UpsertOutcome};
use pogo_storage::{
    FetchError, FetchedPage, FixtureFetcher, HttpClientConfig, HttpFetcher, LibraryIndex,
    LibrarySummary, PageFetcher, UpsertRequest,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pogo-sync";

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub library_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_spacing_ms: u64,
    pub concurrency: usize,
    pub max_pages_per_source: usize,
    pub sync_cron: String,
    /// Replay `routes.json` from this directory instead of fetching live.
    pub fixtures_dir: Option<PathBuf>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            library_dir: PathBuf::from("pogo_library"),
            workspace_root: PathBuf::from("."),
            user_agent: "Mozilla/5.0 (POGO-Library-Builder)".to_string(),
            http_timeout_secs: 25,
            request_spacing_ms: 800,
            concurrency: 4,
            max_pages_per_source: 500,
            sync_cron: "0 0 6 * * *".to_string(),
            fixtures_dir: None,
        }
    }
}

impl BuilderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            library_dir: std::env::var("POGO_LIBRARY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.library_dir),
            workspace_root: std::env::var("POGO_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("POGO_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("POGO_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            request_spacing_ms: env_parse("POGO_REQUEST_SPACING_MS")
                .unwrap_or(defaults.request_spacing_ms),
            concurrency: env_parse("POGO_CONCURRENCY").unwrap_or(defaults.concurrency),
            max_pages_per_source: env_parse("POGO_MAX_PAGES_PER_SOURCE")
                .unwrap_or(defaults.max_pages_per_source),
            sync_cron: std::env::var("POGO_SYNC_CRON").unwrap_or(defaults.sync_cron),
            fixtures_dir: std::env::var("POGO_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency.max(1),
            per_source_concurrency: self.concurrency.clamp(1, 2),
            request_spacing: (self.request_spacing_ms > 0)
                .then(|| Duration::from_millis(self.request_spacing_ms)),
            ..Default::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// A page or source that could not be collected this run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageFailure {
    pub source_id: String,
    pub url: Option<String>,
    pub transient: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub run_id: Uuid,
    pub window: DateWindow,
    pub started_at: DateTime<Utc>,
    pub discovered: BTreeMap<String, usize>,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<PageFailure>,
    pub library: LibrarySummary,
}

impl BuildSummary {
    pub fn stored(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

pub struct LibraryBuilder {
    config: BuilderConfig,
    registry: SourceRegistry,
    fetcher: Arc<dyn PageFetcher>,
}

impl LibraryBuilder {
    pub fn new(config: BuilderConfig, registry: SourceRegistry, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            config,
            registry,
            fetcher,
        }
    }

    /// Loads the registry and picks the live or fixture fetcher from `config`.
    pub fn from_config(config: BuilderConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_default(config.registry_path())?;
        let fetcher: Arc<dyn PageFetcher> = match &config.fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "replaying fixture routes instead of live HTTP");
                Arc::new(FixtureFetcher::from_routes(dir)?)
            }
            None => Arc::new(HttpFetcher::new(config.http_client_config())?),
        };
        Ok(Self::new(config, registry, fetcher))
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub async fn run(&self, window: &DateWindow) -> Result<BuildSummary> {
        self.run_at(window, Utc::now()).await
    }

    /// One incremental build stamped with `now`.
    ///
    /// Discovery and fetches fail per source/page; index corruption or a
    /// failed library write aborts the run.
    pub async fn run_at(&self, window: &DateWindow, now: DateTime<Utc>) -> Result<BuildSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("library_build", %run_id, window = %window);
        async move {
            let mut index = LibraryIndex::load(&self.config.library_dir)
                .await
                .with_context(|| format!("loading library at {}", self.config.library_dir.display()))?;

            let mut failures = Vec::new();
            let mut discovered = BTreeMap::new();
            let mut candidates = Vec::new();
            for source in self.registry.enabled() {
                let adapter = adapter_for_source(source);
                match adapter.discover(self.fetcher.as_ref(), window).await {
                    Ok(mut found) => {
                        if found.len() > self.config.max_pages_per_source {
                            info!(
                                source_id = %source.source_id,
                                found = found.len(),
                                cap = self.config.max_pages_per_source,
                                "candidate list truncated"
                            );
                            found.truncate(self.config.max_pages_per_source);
                        }
                        discovered.insert(source.source_id.clone(), found.len());
                        candidates.extend(found);
                    }
                    Err(err) => {
                        warn!(source_id = %source.source_id, error = %err, "discovery failed");
                        discovered.insert(source.source_id.clone(), 0);
                        failures.push(PageFailure {
                            source_id: source.source_id.clone(),
                            url: None,
                            transient: false,
                            reason: err.to_string(),
                        });
                    }
                }
            }

            let validators = candidates
                .iter()
                .map(|c| {
                    index
                        .lookup_by_url(&c.source_id, &c.url)
                        .map(|entry| entry.validators.clone())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>();
            let fetched = self.fetch_all(&candidates, validators).await;

            let (mut created, mut updated, mut unchanged) = (0, 0, 0);
            for (candidate, result) in candidates.iter().zip(fetched) {
                let page = match result {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(source_id = %candidate.source_id, url = %candidate.url, error = %err, "page fetch failed");
                        failures.push(PageFailure {
                            source_id: candidate.source_id.clone(),
                            url: Some(candidate.url.clone()),
                            transient: err.is_transient(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };
                // a page keeps the slug it was first filed under
                let (slug, published_on) =
                    match index.lookup_by_url(&candidate.source_id, &candidate.url) {
                        Some(existing) => (
                            existing.slug.clone(),
                            existing.published_on.or(Some(candidate.published_on)),
                        ),
                        None => (candidate.slug(), Some(candidate.published_on)),
                    };
                let outcome = if page.is_not_modified() {
                    match index.mark_not_modified(&candidate.source_id, &slug, now) {
                        Some(outcome) => outcome,
                        None => {
                            warn!(url = %candidate.url, "not modified but nothing stored");
                            failures.push(PageFailure {
                                source_id: candidate.source_id.clone(),
                                url: Some(candidate.url.clone()),
                                transient: true,
                                reason: "server answered 304 for a page with no snapshot".to_string(),
                            });
                            continue;
                        }
                    }
                } else {
                    index
                        .upsert(
                            UpsertRequest {
                                source_id: &candidate.source_id,
                                url: &candidate.url,
                                slug: &slug,
                                title: &candidate.title,
                                published_on,
                                body: &page.body,
                                validators: page.validators.clone(),
                            },
                            now,
                        )
                        .await
                        .with_context(|| format!("storing {}", candidate.url))?
                };
                match outcome {
                    UpsertOutcome::Created => created += 1,
                    UpsertOutcome::Updated => updated += 1,
                    UpsertOutcome::Unchanged => unchanged += 1,
                }
            }

            let library = index
                .commit(Some(*window), now)
                .await
                .context("committing library index")?;
            info!(created, updated, unchanged, failed = failures.len(), "library build finished");

            Ok(BuildSummary {
                run_id,
                window: *window,
                started_at: now,
                discovered,
                created,
                updated,
                unchanged,
                failures,
                library,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetches every candidate concurrently; results come back in candidate order.
    /// Fetches every candidate concurrently; known pages go out as conditional requests.
    async fn fetch_all(
        &self,
        candidates: &[CandidatePage],
        validators: Vec<PageValidators>,
    ) -> Vec<Result<FetchedPage, FetchError>> {
        let mut set = JoinSet::new();
        for ((idx, candidate), validators) in candidates.iter().enumerate().zip(validators) {
            let fetcher = Arc::clone(&self.fetcher);
            let source_id = candidate.source_id.clone();
            let url = candidate.url.clone();
            set.spawn(async move {
                (idx, fetcher.fetch_if_changed(&source_id, &url, &validators).await)
            });
        }

        let mut slots: Vec<Option<Result<FetchedPage, FetchError>>> =
            (0..candidates.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(err) => warn!(error = %err, "fetch task aborted"),
            }
        }
        slots
            .into_iter()
            .zip(candidates)
            .map(|(slot, candidate)| {
                slot.unwrap_or_else(|| Err(FetchError::transient(&candidate.url, "fetch task aborted")))
            })
            .collect()
    }
}

/// Runs `task` on `cron` (six fields, seconds first).
pub async fn build_scheduler<F, Fut>(cron: &str, task: F) -> Result<JobScheduler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let task = Arc::new(task);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let task = Arc::clone(&task);
        Box::pin(async move {
            task().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pogo_storage::{IndexError, SOURCE_MANIFEST};
    use std::path::Path;
    use tempfile::tempdir;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, day, 6, 0, 0).single().expect("ts")
    }

    fn september() -> DateWindow {
        DateWindow::month("2025-09").unwrap()
    }

    fn builder(library: &Path, fetcher: Arc<FixtureFetcher>) -> LibraryBuilder {
        let config = BuilderConfig {
            library_dir: library.to_path_buf(),
            ..BuilderConfig::default()
        };
        LibraryBuilder::new(config, SourceRegistry::default(), fetcher)
    }

    fn fixture_fetcher() -> Arc<FixtureFetcher> {
        Arc::new(FixtureFetcher::from_routes(fixtures_dir()).expect("fixture routes"))
    }

    #[tokio::test]
    async fn september_scenario_builds_then_detects_one_change() {
        let dir = tempdir().unwrap();
        let fetcher = fixture_fetcher();
        let builder = builder(dir.path(), fetcher.clone());

        let first = builder.run_at(&september(), at(1)).await.unwrap();
        assert_eq!(first.created, 12);
        assert!(first.failures.is_empty());
        assert_eq!(first.discovered.get("niantic"), Some(&6));
        assert_eq!(first.discovered.get("leekduck"), Some(&6));
        assert_eq!(first.library.counts.values().sum::<usize>(), 12);

        let second = builder.run_at(&september(), at(2)).await.unwrap();
        assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 12));

        fetcher.set_page(
            "https://leekduck.com/events/raid-hour-heatran-2025-09-17/",
            "<html><body><h1>Heatran Raid Hour</h1><p>rescheduled</p></body></html>",
        );
        let third = builder.run_at(&september(), at(3)).await.unwrap();
        assert_eq!((third.created, third.updated, third.unchanged), (0, 1, 11));

        let index = LibraryIndex::load(dir.path()).await.unwrap();
        assert_eq!(index.len(), 12);
        let entry = index
            .lookup("leekduck", "2025-09-17_heatran-raid-hour")
            .expect("heatran entry");
        assert_eq!(entry.first_seen, at(1));
        assert_eq!(entry.last_fetched, at(3));
    }

    #[tokio::test]
    async fn undated_hub_link_keeps_its_slug_across_windows() {
        let dir = tempdir().unwrap();
        let hub = "https://leekduck.com/events/";
        let fetcher = Arc::new(
            FixtureFetcher::new()
                .with_page(
                    hub,
                    r#"<html><body><a href="/events/go-fest-global/"><h3>GO Fest Global</h3></a></body></html>"#,
                )
                .with_page(
                    "https://leekduck.com/events/go-fest-global/",
                    "<html><body><h1>GO Fest Global</h1></body></html>",
                ),
        );
        let mut registry = SourceRegistry::default();
        registry.sources.retain(|s| s.source_id == "leekduck");
        registry.sources[0].listing_urls = vec![hub.to_string()];
        let config = BuilderConfig {
            library_dir: dir.path().to_path_buf(),
            ..BuilderConfig::default()
        };
        let builder = LibraryBuilder::new(config, registry, fetcher);

        let first = builder.run_at(&september(), at(1)).await.unwrap();
        assert_eq!(first.created, 1);

        let october = DateWindow::month("2025-10").unwrap();
        let next_month = Utc.with_ymd_and_hms(2025, 10, 1, 6, 0, 0).single().expect("ts");
        let second = builder.run_at(&october, next_month).await.unwrap();
        assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 1));

        let index = LibraryIndex::load(dir.path()).await.unwrap();
        assert_eq!(index.len(), 1);
        let entry = index
            .lookup("leekduck", "2025-09-01_go-fest-global")
            .expect("entry filed under the first run's slug");
        assert_eq!(entry.first_seen, at(1));
        assert_eq!(entry.last_fetched, next_month);
        assert_eq!(entry.published_on, chrono::NaiveDate::from_ymd_opt(2025, 9, 1));
        assert!(index.lookup("leekduck", "2025-10-01_go-fest-global").is_none());
    }

    #[tokio::test]
    async fn known_pages_are_revalidated_with_their_etag() {
        let dir = tempdir().unwrap();
        let hub = "https://leekduck.com/events/";
        let event = "https://leekduck.com/events/raid-hour-heatran-2025-09-17/";
        let fetcher = Arc::new(FixtureFetcher::new().with_page(
            hub,
            r#"<html><body><a href="/events/raid-hour-heatran-2025-09-17/" data-event-start-date="2025-09-17"><h3>Heatran Raid Hour</h3></a></body></html>"#,
        ));
        fetcher.set_page_with_etag(event, "<html><h1>Heatran Raid Hour</h1></html>", "\"r1\"");
        let mut registry = SourceRegistry::default();
        registry.sources.retain(|s| s.source_id == "leekduck");
        registry.sources[0].listing_urls = vec![hub.to_string()];
        let config = BuilderConfig {
            library_dir: dir.path().to_path_buf(),
            ..BuilderConfig::default()
        };
        let builder = LibraryBuilder::new(config, registry, fetcher.clone());

        let first = builder.run_at(&september(), at(1)).await.unwrap();
        assert_eq!(first.created, 1);
        let second = builder.run_at(&september(), at(2)).await.unwrap();
        assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 1));
        assert!(second.failures.is_empty());

        let index = LibraryIndex::load(dir.path()).await.unwrap();
        let entry = index.lookup_by_url("leekduck", event).expect("entry");
        assert_eq!(entry.validators.etag.as_deref(), Some("\"r1\""));
        assert_eq!(entry.last_fetched, at(2));
        assert_eq!(
            index.read_snapshot(entry).await.unwrap(),
            "<html><h1>Heatran Raid Hour</h1></html>"
        );

        fetcher.set_page_with_etag(event, "<html><h1>Heatran Raid Hour</h1><p>moved</p></html>", "\"r2\"");
        let third = builder.run_at(&september(), at(3)).await.unwrap();
        assert_eq!((third.created, third.updated, third.unchanged), (0, 1, 0));
        let index = LibraryIndex::load(dir.path()).await.unwrap();
        let entry = index.lookup_by_url("leekduck", event).expect("entry");
        assert_eq!(entry.validators.etag.as_deref(), Some("\"r2\""));
    }

    #[tokio::test]
    async fn permanent_page_failure_is_isolated() {
        let dir = tempdir().unwrap();
        let fetcher = fixture_fetcher();
        let url = "https://pokemongolive.com/news/spotlight-hour-pikachu-september";
        fetcher.set_failure(url, FetchError::permanent(url, "http status 404 Not Found"));

        let summary = builder(dir.path(), fetcher).run_at(&september(), at(1)).await.unwrap();
        assert_eq!(summary.created, 11);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].url.as_deref(), Some(url));
        assert!(!summary.failures[0].transient);
    }

    #[tokio::test]
    async fn unreachable_source_does_not_stop_the_other() {
        let dir = tempdir().unwrap();
        let fetcher = fixture_fetcher();
        for url in [
            "https://pokemongolive.com/news/?format=rss",
            "https://pokemongolive.com/news/",
        ] {
            fetcher.set_failure(url, FetchError::transient(url, "timed out"));
        }

        let summary = builder(dir.path(), fetcher).run_at(&september(), at(1)).await.unwrap();
        assert_eq!(summary.created, 6);
        assert_eq!(summary.discovered.get("niantic"), Some(&0));
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].source_id, "niantic");
    }

    #[tokio::test]
    async fn per_source_cap_truncates_candidates() {
        let dir = tempdir().unwrap();
        let config = BuilderConfig {
            library_dir: dir.path().to_path_buf(),
            max_pages_per_source: 2,
            ..BuilderConfig::default()
        };
        let builder = LibraryBuilder::new(config, SourceRegistry::default(), fixture_fetcher());
        let summary = builder.run_at(&september(), at(1)).await.unwrap();
        assert_eq!(summary.created, 4);
    }

    #[tokio::test]
    async fn corrupt_index_aborts_the_run() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("niantic")).unwrap();
        std::fs::write(dir.path().join("niantic").join(SOURCE_MANIFEST), "[{]").unwrap();

        let err = builder(dir.path(), fixture_fetcher())
            .run_at(&september(), at(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corruption { .. })
        ));
    }

    #[test]
    fn http_config_follows_builder_settings() {
        let config = BuilderConfig {
            request_spacing_ms: 0,
            concurrency: 6,
            ..BuilderConfig::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.global_concurrency, 6);
        assert_eq!(http.per_source_concurrency, 2);
        assert!(http.request_spacing.is_none());
        assert_eq!(http.timeout, Duration::from_secs(25));
    }
}
