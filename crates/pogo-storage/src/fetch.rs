use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pogo_core::PageValidators;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub validators: PageValidators,
}

impl FetchedPage {
    /// The server confirmed the stored copy; `body` is empty.
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("permanent failure fetching {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    pub fn transient(url: &str, reason: impl Into<String>) -> Self {
        FetchError::Transient {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn permanent(url: &str, reason: impl Into<String>) -> Self {
        FetchError::Permanent {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. } | FetchError::Permanent { url, .. } => url,
        }
    }
}

/// Retrieves raw markup for a URL. No business logic, no shared mutable state.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError>;

    /// Conditional fetch; may answer 304 with an empty body when `validators` still hold.
    async fn fetch_if_changed(
        &self,
        source_id: &str,
        url: &str,
        _validators: &PageValidators,
    ) -> Result<FetchedPage, FetchError> {
        self.fetch(source_id, url).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub request_spacing: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: Some("Mozilla/5.0 (POGO-Library-Builder)".to_string()),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            request_spacing: None,
        }
    }
}

/// Minimum gap between consecutive requests, shared by every caller.
#[derive(Debug)]
pub struct RequestSpacing {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestSpacing {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let wait_until = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let turn = match *slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *slot = Some(turn + self.spacing);
            turn
        };
        tokio::time::sleep_until(wait_until).await;
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    spacing: Option<RequestSpacing>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            spacing: config.request_spacing.map(RequestSpacing::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        validators: &PageValidators,
    ) -> Result<FetchedPage, FetchError> {
        let mut last_failure = String::from("no attempt made");

        for attempt in 0..=self.backoff.max_retries {
            if let Some(spacing) = &self.spacing {
                spacing.wait_turn().await;
            }

            let mut request = self.client.get(url);
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified.as_str());
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let fresh = response_validators(resp.headers());

                    if status == StatusCode::NOT_MODIFIED {
                        debug!(url, "not modified");
                        return Ok(FetchedPage {
                            url: url.to_string(),
                            final_url,
                            status: status.as_u16(),
                            body: Vec::new(),
                            validators: if fresh.is_empty() { validators.clone() } else { fresh },
                        });
                    }
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedPage {
                                    url: url.to_string(),
                                    final_url,
                                    status: status.as_u16(),
                                    body: body.to_vec(),
                                    validators: fresh,
                                })
                            }
                            Err(err) => {
                                last_failure = format!("reading body: {err}");
                            }
                        }
                    } else if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::permanent(url, format!("http status {status}")));
                    } else {
                        last_failure = format!("http status {status}");
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::permanent(url, err.to_string()));
                    }
                    last_failure = err.to_string();
                }
            }

            if attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, reason = %last_failure, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
        }

        warn!(url, reason = %last_failure, "fetch retries exhausted");
        Err(FetchError::transient(
            url,
            format!(
                "{last_failure} (after {} attempts)",
                self.backoff.max_retries + 1
            ),
        ))
    }
}

fn response_validators(headers: &HeaderMap) -> PageValidators {
    let text = |value: Option<&reqwest::header::HeaderValue>| {
        value
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    PageValidators {
        etag: text(headers.get(ETAG)),
        last_modified: text(headers.get(LAST_MODIFIED)),
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_if_changed(source_id, url, &PageValidators::default())
            .await
    }

    async fn fetch_if_changed(
        &self,
        source_id: &str,
        url: &str,
        validators: &PageValidators,
    ) -> Result<FetchedPage, FetchError> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(FetchError::permanent(
                    url,
                    format!("unsupported scheme `{}`", parsed.scheme()),
                ))
            }
            Err(err) => return Err(FetchError::permanent(url, format!("malformed url: {err}"))),
        }

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::permanent(url, "fetcher shut down"))?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::permanent(url, "fetcher shut down"))?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url, validators)
            .instrument(span)
            .await
    }
}

/// Route manifest file read by [`FixtureFetcher::from_routes`].
pub const FIXTURE_ROUTES: &str = "routes.json";

#[derive(Debug, Clone)]
enum FixtureResponse {
    Body { body: Vec<u8>, etag: Option<String> },
    Fail(FetchError),
}

/// Serves canned responses keyed by URL; unknown URLs are permanent 404s.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    pages: StdMutex<HashMap<String, FixtureResponse>>,
    requests: StdMutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.set_page(url, body);
        self
    }

    pub fn set_page(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.insert(url.into(), FixtureResponse::Body { body: body.into(), etag: None });
    }

    /// Serves `body` with an `ETag`; a matching conditional fetch gets a 304.
    pub fn set_page_with_etag(
        &self,
        url: impl Into<String>,
        body: impl Into<Vec<u8>>,
        etag: impl Into<String>,
    ) {
        self.insert(
            url.into(),
            FixtureResponse::Body {
                body: body.into(),
                etag: Some(etag.into()),
            },
        );
    }

    fn insert(&self, url: String, response: FixtureResponse) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(url, response);
        }
    }

    pub fn set_failure(&self, url: impl Into<String>, error: FetchError) {
        self.insert(url.into(), FixtureResponse::Fail(error));
    }

    /// Loads `<dir>/routes.json`, a map of URL to fixture file relative to `dir`.
    pub fn from_routes(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let manifest = dir.join(FIXTURE_ROUTES);
        let text = std::fs::read_to_string(&manifest)
            .with_context(|| format!("reading {}", manifest.display()))?;
        let routes: BTreeMap<String, String> = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", manifest.display()))?;
        let fetcher = Self::new();
        for (url, file) in routes {
            let path = dir.join(&file);
            let body =
                std::fs::read(&path).with_context(|| format!("reading fixture {}", path.display()))?;
            fetcher.set_page(url, body);
        }
        Ok(fetcher)
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_if_changed(source_id, url, &PageValidators::default())
            .await
    }

    async fn fetch_if_changed(
        &self,
        _source_id: &str,
        url: &str,
        validators: &PageValidators,
    ) -> Result<FetchedPage, FetchError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        let response = self
            .pages
            .lock()
            .ok()
            .and_then(|pages| pages.get(url).cloned());
        match response {
            Some(FixtureResponse::Body { etag, .. })
                if etag.is_some() && etag == validators.etag =>
            {
                Ok(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: StatusCode::NOT_MODIFIED.as_u16(),
                    body: Vec::new(),
                    validators: validators.clone(),
                })
            }
            Some(FixtureResponse::Body { body, etag }) => Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                body,
                validators: PageValidators {
                    etag,
                    last_modified: None,
                },
            }),
            Some(FixtureResponse::Fail(err)) => Err(err),
            None => Err(FetchError::permanent(url, "http status 404 Not Found")),
        }
    }
}
