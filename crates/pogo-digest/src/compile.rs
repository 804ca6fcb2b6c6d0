use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pogo_adapters::{adapter_for_source, SourceAdapter, SourceRegistry};
use pogo_core::{DateWindow, EventRecord, LibraryIndexEntry};
use pogo_storage::LibraryIndex;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::export::{write_ics, write_parquet_snapshots, write_xlsx, DigestExporter};
use crate::merge::{MergeConfig, MergedDigest, Merger};
use crate::normalize::{normalize, CategoryRules};
use crate::{CompileFailure, FailureStage};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Keep only events overlapping this window.
    pub window: Option<DateWindow>,
    pub rules: CategoryRules,
    pub merge: MergeConfig,
    pub registry: SourceRegistry,
}

impl CompileOptions {
    /// Rules and registry from the workspace files, merge thresholds from the environment.
    pub fn from_workspace_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        Ok(Self {
            window: None,
            rules: CategoryRules::from_workspace_root(root)?,
            merge: MergeConfig::from_env(),
            registry: SourceRegistry::load_or_default(root.join("sources.yaml"))?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DigestOutputs {
    pub xlsx: Option<PathBuf>,
    pub ics: Option<PathBuf>,
    pub parquet_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub generated_at: DateTime<Utc>,
    pub window: Option<DateWindow>,
    pub pages_read: usize,
    pub records_normalized: usize,
    pub events: usize,
    pub review_items: usize,
    pub failures: Vec<CompileFailure>,
    pub outputs: Vec<String>,
}

pub struct DigestCompiler {
    options: CompileOptions,
    adapters: BTreeMap<String, Box<dyn SourceAdapter>>,
}

impl DigestCompiler {
    pub fn new(options: CompileOptions) -> Self {
        let adapters = options
            .registry
            .sources
            .iter()
            .map(|source| (source.source_id.clone(), adapter_for_source(source)))
            .collect();
        Self { options, adapters }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Extracts, normalizes, and merges every snapshot in `index`.
    ///
    /// A page that cannot be read, extracted, or normalized becomes a
    /// [`CompileFailure`] and the rest of the library still compiles.
    pub async fn compile(&self, index: &LibraryIndex) -> MergedDigest {
        let (records, failures) = self.collect_records(index).await;
        let mut digest = Merger::new(self.options.merge.clone()).merge(records);
        digest.failures = failures;
        digest
    }

    async fn collect_records(&self, index: &LibraryIndex) -> (Vec<EventRecord>, Vec<CompileFailure>) {
        let mut records = Vec::new();
        let mut failures = Vec::new();
        for entry in index.scan(None) {
            match self.compile_entry(index, entry).await {
                Ok(record) if self.in_window(&record) => records.push(record),
                Ok(record) => {
                    debug!(slug = %entry.slug, title = %record.title, "event outside window");
                }
                Err((stage, reason)) => {
                    warn!(
                        source_id = %entry.source_id,
                        slug = %entry.slug,
                        ?stage,
                        reason = %reason,
                        "page skipped"
                    );
                    failures.push(CompileFailure {
                        source_id: entry.source_id.clone(),
                        slug: entry.slug.clone(),
                        url: entry.url.clone(),
                        stage,
                        reason,
                    });
                }
            }
        }
        (records, failures)
    }

    async fn compile_entry(
        &self,
        index: &LibraryIndex,
        entry: &LibraryIndexEntry,
    ) -> Result<EventRecord, (FailureStage, String)> {
        let adapter = self.adapters.get(&entry.source_id).ok_or_else(|| {
            (
                FailureStage::UnknownSource,
                format!("no adapter registered for `{}`", entry.source_id),
            )
        })?;
        let markup = index
            .read_snapshot(entry)
            .await
            .map_err(|e| (FailureStage::Snapshot, e.to_string()))?;
        let raw = adapter
            .extract(&markup)
            .map_err(|e| (FailureStage::Extraction, e.to_string()))?;
        normalize(&raw, entry.provenance(), entry.first_seen, &self.options.rules)
            .map_err(|e| (FailureStage::Normalization, e.to_string()))
    }

    fn in_window(&self, record: &EventRecord) -> bool {
        let Some(window) = &self.options.window else {
            return true;
        };
        let start = record.timing.start_date();
        let end = record.timing.end_key().map(|e| e.date()).unwrap_or(start);
        start <= window.end && end >= window.start
    }

    /// Loads the library at `library_root`, compiles it, and writes the requested outputs.
    ///
    /// Index corruption and output write failures abort; page failures do not.
    pub async fn run(
        &self,
        library_root: &Path,
        outputs: &DigestOutputs,
        generated_at: DateTime<Utc>,
    ) -> Result<(MergedDigest, CompileReport)> {
        let span = info_span!("digest_compile", library = %library_root.display());
        async move {
            let index = LibraryIndex::load(library_root)
                .await
                .with_context(|| format!("loading library at {}", library_root.display()))?;
            let pages_read = index.len();

            let digest = self.compile(&index).await;

            let tables = DigestExporter::new(self.options.registry.clone()).render(&digest, &index);
            let mut written = Vec::new();
            if let Some(path) = &outputs.xlsx {
                write_xlsx(path, &tables)?;
                written.push(path.display().to_string());
            }
            if let Some(path) = &outputs.ics {
                write_ics(path, &tables.calendar, generated_at)?;
                written.push(path.display().to_string());
            }
            if let Some(dir) = &outputs.parquet_dir {
                let manifest = write_parquet_snapshots(dir, &tables, generated_at)?;
                written.push(manifest.display().to_string());
            }

            let report = CompileReport {
                generated_at,
                window: self.options.window,
                pages_read,
                records_normalized: digest.input_records,
                events: digest.records.len(),
                review_items: digest.review.len(),
                failures: digest.failures.clone(),
                outputs: written,
            };
            info!(
                pages = report.pages_read,
                records = report.records_normalized,
                events = report.events,
                review = report.review_items,
                failed = report.failures.len(),
                "digest compiled"
            );
            Ok((digest, report))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use pogo_storage::{FixtureFetcher, UpsertRequest};
    use pogo_sync::{BuilderConfig, LibraryBuilder};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, day, 6, 0, 0).single().unwrap()
    }

    fn page(title: &str, schedule: &str) -> String {
        format!(
            "<html><body><article><h1>{title}</h1><p>{schedule}</p><p>More to come.</p></article></body></html>"
        )
    }

    #[tokio::test]
    async fn one_bad_page_does_not_sink_the_rest() {
        let dir = tempdir().unwrap();
        let mut index = LibraryIndex::load(dir.path()).await.unwrap();
        for day in 1..=10u32 {
            let body = if day == 5 {
                page("Broken Schedule", "February 30, 2025, from 2:00 p.m. to 5:00 p.m.")
            } else {
                page(
                    &format!("Field Note {day}"),
                    &format!("September {day}, 2025, from 2:00 p.m. to 5:00 p.m. local time"),
                )
            };
            let slug = format!("2025-09-{day:02}_field-note-{day}");
            let url = format!("https://pokemongolive.com/news/field-note-{day}");
            let title = format!("Field Note {day}");
            index
                .upsert(
                    UpsertRequest {
                        source_id: "niantic",
                        url: &url,
                        slug: &slug,
                        title: &title,
                        published_on: NaiveDate::from_ymd_opt(2025, 9, day),
                        body: body.as_bytes(),
                        validators: Default::default(),
                    },
                    at(1),
                )
                .await
                .unwrap();
        }

        let digest = DigestCompiler::new(CompileOptions::default()).compile(&index).await;
        assert_eq!(digest.records.len(), 9);
        assert_eq!(digest.failures.len(), 1);
        assert_eq!(digest.failures[0].stage, FailureStage::Normalization);
        assert_eq!(digest.failures[0].slug, "2025-09-05_field-note-5");
    }

    #[tokio::test]
    async fn window_keeps_overlapping_events_only() {
        let dir = tempdir().unwrap();
        let mut index = LibraryIndex::load(dir.path()).await.unwrap();
        for (slug, schedule) in [
            ("early", "August 30, 2025, from 2:00 p.m. to 5:00 p.m."),
            ("spanning", "August 30, 2025 to September 2, 2025"),
            ("late", "October 3, 2025, at 6:00 p.m."),
        ] {
            let body = page(&format!("Event {slug}"), schedule);
            index
                .upsert(
                    UpsertRequest {
                        source_id: "niantic",
                        url: &format!("https://pokemongolive.com/news/{slug}"),
                        slug,
                        title: slug,
                        published_on: None,
                        body: body.as_bytes(),
                        validators: Default::default(),
                    },
                    at(1),
                )
                .await
                .unwrap();
        }

        let options = CompileOptions {
            window: Some(DateWindow::month("2025-09").unwrap()),
            ..CompileOptions::default()
        };
        let digest = DigestCompiler::new(options).compile(&index).await;
        let titles = digest.records.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Event spanning"]);
        assert!(digest.failures.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let dir = tempdir().unwrap();
        let mut index = LibraryIndex::load(dir.path()).await.unwrap();
        let body = page("Community Day", "September 14, 2025, 2:00 p.m. to 5:00 p.m.");
        index
            .upsert(
                UpsertRequest {
                    source_id: "serebii",
                    url: "https://serebii.test/cd",
                    slug: "2025-09-14_community-day",
                    title: "Community Day",
                    published_on: None,
                    body: body.as_bytes(),
                    validators: Default::default(),
                },
                at(1),
            )
            .await
            .unwrap();

        let digest = DigestCompiler::new(CompileOptions::default()).compile(&index).await;
        assert!(digest.records.is_empty());
        assert_eq!(digest.failures[0].stage, FailureStage::UnknownSource);
    }

    #[tokio::test]
    async fn fixture_library_compiles_into_merged_digest() {
        let library = tempdir().unwrap();
        let out = tempdir().unwrap();
        let september = DateWindow::month("2025-09").unwrap();

        let fetcher = Arc::new(FixtureFetcher::from_routes(workspace_root().join("fixtures")).unwrap());
        let config = BuilderConfig {
            library_dir: library.path().to_path_buf(),
            ..BuilderConfig::default()
        };
        let build = LibraryBuilder::new(config, SourceRegistry::default(), fetcher)
            .run_at(&september, at(1))
            .await
            .unwrap();
        assert_eq!(build.created, 12);

        let options = CompileOptions {
            window: Some(september),
            ..CompileOptions::from_workspace_root(workspace_root()).unwrap()
        };
        let outputs = DigestOutputs {
            xlsx: Some(out.path().join("digest.xlsx")),
            ics: Some(out.path().join("digest.ics")),
            parquet_dir: Some(out.path().join("snapshots")),
        };
        let compiler = DigestCompiler::new(options);
        let (digest, report) = compiler.run(library.path(), &outputs, at(2)).await.unwrap();

        assert_eq!(report.pages_read, 12);
        assert_eq!(report.records_normalized, 11);
        assert_eq!(report.events, 8);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].source_id, "leekduck");
        assert_eq!(report.outputs.len(), 3);

        let index = LibraryIndex::load(library.path()).await.unwrap();
        let direct = compiler.compile(&index).await;
        assert_eq!(direct.records, digest.records);
        assert_eq!(direct.input_records, report.records_normalized);

        let solosis = digest
            .records
            .iter()
            .find(|r| r.title == "Pokémon GO Community Day: Solosis")
            .expect("community day record");
        assert_eq!(solosis.provenance.len(), 2);
        assert_eq!(solosis.source_ids().into_iter().collect::<Vec<_>>(), vec!["leekduck", "niantic"]);

        let mut resorted = digest.records.clone();
        resorted.sort_by(EventRecord::digest_cmp);
        assert_eq!(resorted, digest.records);

        let ics = std::fs::read_to_string(out.path().join("digest.ics")).unwrap();
        assert_eq!(ics.matches("BEGIN:VEVENT").count(), 8);
        assert!(out.path().join("snapshots").join("manifest.json").exists());
    }

    #[tokio::test]
    async fn corrupt_library_aborts_the_compile() {
        let library = tempdir().unwrap();
        std::fs::create_dir_all(library.path().join("leekduck")).unwrap();
        std::fs::write(library.path().join("leekduck").join("index.json"), "not json").unwrap();

        let err = DigestCompiler::new(CompileOptions::default())
            .run(library.path(), &DigestOutputs::default(), at(2))
            .await
            .unwrap_err();
        assert!(err
            .downcast_ref::<pogo_storage::IndexError>()
            .is_some());
    }
}
