use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use pogo_core::{DateWindow, LibraryIndexEntry, PageValidators, UpsertOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::{write_atomic, SnapshotStore};

/// Per-source manifest file name.
pub const SOURCE_MANIFEST: &str = "index.json";
/// Top-level manifest aggregating every source.
pub const LIBRARY_MANIFEST: &str = "library_index.json";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("library index at {path} is corrupt: {message}")]
    Corruption { path: PathBuf, message: String },
    #[error("library I/O failure at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl IndexError {
    fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        IndexError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    fn corrupt(path: &Path, message: impl Into<String>) -> Self {
        IndexError::Corruption {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRequest<'a> {
    pub source_id: &'a str,
    pub url: &'a str,
    pub slug: &'a str,
    pub title: &'a str,
    pub published_on: Option<NaiveDate>,
    pub body: &'a [u8],
    pub validators: PageValidators,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCoverage {
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

/// Contents of `library_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibrarySummary {
    pub generated_at: DateTime<Utc>,
    pub range: Option<DateWindow>,
    pub counts: BTreeMap<String, usize>,
    pub folders: BTreeMap<String, String>,
    pub coverage: BTreeMap<String, SourceCoverage>,
}

#[derive(Debug, Default)]
struct SourceManifest {
    entries: BTreeMap<String, LibraryIndexEntry>,
    dirty: bool,
}

/// Deduplicated catalog of fetched pages, one manifest per source.
///
/// Mutation takes `&mut self`: one writer per run. Every created/updated
/// upsert writes the snapshot first and the manifest second, both through
/// atomic replace.
#[derive(Debug)]
pub struct LibraryIndex {
    store: SnapshotStore,
    sources: BTreeMap<String, SourceManifest>,
}

impl LibraryIndex {
    /// Loads every `<root>/<source>/index.json`. A missing root is an empty library.
    pub async fn load(root: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let root = root.into();
        let mut sources = BTreeMap::new();

        if fs::try_exists(&root).await.map_err(|e| IndexError::io(&root, e))? {
            let mut dir = fs::read_dir(&root).await.map_err(|e| IndexError::io(&root, e))?;
            while let Some(item) = dir.next_entry().await.map_err(|e| IndexError::io(&root, e))? {
                let is_dir = item
                    .file_type()
                    .await
                    .map(|ft| ft.is_dir())
                    .unwrap_or(false);
                if !is_dir {
                    continue;
                }
                let manifest_path = item.path().join(SOURCE_MANIFEST);
                if !fs::try_exists(&manifest_path)
                    .await
                    .map_err(|e| IndexError::io(&manifest_path, e))?
                {
                    continue;
                }
                let source_id = item.file_name().to_string_lossy().to_string();
                let manifest = read_source_manifest(&manifest_path, &source_id).await?;
                debug!(source_id, entries = manifest.entries.len(), "loaded source manifest");
                sources.insert(source_id, manifest);
            }
        }

        Ok(Self {
            store: SnapshotStore::new(root),
            sources,
        })
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(|m| m.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn lookup(&self, source_id: &str, slug: &str) -> Option<&LibraryIndexEntry> {
        self.sources.get(source_id)?.entries.get(slug)
    }

    /// The entry already stored for `url`, whatever slug it was filed under.
    pub fn lookup_by_url(&self, source_id: &str, url: &str) -> Option<&LibraryIndexEntry> {
        self.sources
            .get(source_id)?
            .entries
            .values()
            .find(|entry| entry.url == url)
    }

    /// Entries ordered by `(source, slug)`; undated entries match every window.
    pub fn scan(&self, window: Option<&DateWindow>) -> Vec<&LibraryIndexEntry> {
        self.sources
            .values()
            .flat_map(|m| m.entries.values())
            .filter(|entry| match (window, entry.published_on) {
                (Some(w), Some(date)) => w.contains(date),
                _ => true,
            })
            .collect()
    }

    pub async fn upsert(
        &mut self,
        request: UpsertRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, IndexError> {
        let fingerprint = SnapshotStore::sha256_hex(request.body);
        let root = self.store.root().to_path_buf();
        let manifest = self.sources.entry(request.source_id.to_string()).or_default();

        let outcome = match manifest.entries.get_mut(request.slug) {
            Some(entry) if entry.fingerprint == fingerprint => {
                entry.last_fetched = now;
                entry.url = request.url.to_string();
                entry.validators = request.validators;
                manifest.dirty = true;
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(entry) => {
                let stored = self
                    .store
                    .write_snapshot(request.source_id, request.slug, request.body)
                    .await
                    .map_err(|e| IndexError::io(&root.join(request.source_id), format!("{e:#}")))?;
                entry.url = request.url.to_string();
                entry.title = request.title.to_string();
                entry.published_on = request.published_on.or(entry.published_on);
                entry.snapshot_path = path_to_manifest_string(&stored.relative_path);
                entry.fingerprint = stored.fingerprint;
                entry.byte_size = stored.byte_size as u64;
                entry.last_fetched = now;
                entry.validators = request.validators;
                UpsertOutcome::Updated
            }
            None => {
                let stored = self
                    .store
                    .write_snapshot(request.source_id, request.slug, request.body)
                    .await
                    .map_err(|e| IndexError::io(&root.join(request.source_id), format!("{e:#}")))?;
                manifest.entries.insert(
                    request.slug.to_string(),
                    LibraryIndexEntry {
                        slug: request.slug.to_string(),
                        source_id: request.source_id.to_string(),
                        url: request.url.to_string(),
                        title: request.title.to_string(),
                        published_on: request.published_on,
                        snapshot_path: path_to_manifest_string(&stored.relative_path),
                        first_seen: now,
                        last_fetched: now,
                        fingerprint: stored.fingerprint,
                        byte_size: stored.byte_size as u64,
                        validators: request.validators,
                    },
                );
                UpsertOutcome::Created
            }
        };

        write_source_manifest(&root, request.source_id, manifest).await?;
        info!(
            source_id = request.source_id,
            slug = request.slug,
            outcome = ?outcome,
            "snapshot stored"
        );
        Ok(outcome)
    }

    /// Records a 304 for a stored page: only `last_fetched` moves.
    ///
    /// Returns `None` when no entry is filed under `slug`.
    pub fn mark_not_modified(
        &mut self,
        source_id: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Option<UpsertOutcome> {
        let manifest = self.sources.get_mut(source_id)?;
        let entry = manifest.entries.get_mut(slug)?;
        entry.last_fetched = now;
        manifest.dirty = true;
        debug!(source_id, slug, "snapshot not modified");
        Some(UpsertOutcome::Unchanged)
    }

    /// Reads the snapshot markup behind an entry, lossily decoded as UTF-8.
    pub async fn read_snapshot(&self, entry: &LibraryIndexEntry) -> Result<String, IndexError> {
        let bytes = self
            .store
            .read_snapshot(&entry.snapshot_path)
            .await
            .map_err(|e| IndexError::io(&self.root().join(&entry.snapshot_path), format!("{e:#}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Flushes pending `last_fetched` stamps and rewrites `library_index.json`.
    pub async fn commit(
        &mut self,
        range: Option<DateWindow>,
        now: DateTime<Utc>,
    ) -> Result<LibrarySummary, IndexError> {
        let root = self.store.root().to_path_buf();
        for (source_id, manifest) in self.sources.iter_mut() {
            if manifest.dirty {
                write_source_manifest(&root, source_id, manifest).await?;
            }
        }

        let summary = self.summary(range, now);
        let path = root.join(LIBRARY_MANIFEST);
        let bytes = serde_json::to_vec_pretty(&summary)
            .map_err(|e| IndexError::io(&path, e))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| IndexError::io(&path, format!("{e:#}")))?;
        Ok(summary)
    }

    pub fn summary(&self, range: Option<DateWindow>, now: DateTime<Utc>) -> LibrarySummary {
        let mut counts = BTreeMap::new();
        let mut folders = BTreeMap::new();
        let mut coverage = BTreeMap::new();
        for (source_id, manifest) in &self.sources {
            counts.insert(source_id.clone(), manifest.entries.len());
            folders.insert(
                source_id.clone(),
                self.root().join(source_id).display().to_string(),
            );
            let dates = manifest
                .entries
                .values()
                .filter_map(|e| e.published_on)
                .collect::<Vec<_>>();
            coverage.insert(
                source_id.clone(),
                SourceCoverage {
                    earliest: dates.iter().min().copied(),
                    latest: dates.iter().max().copied(),
                },
            );
        }
        LibrarySummary {
            generated_at: now,
            range,
            counts,
            folders,
            coverage,
        }
    }
}

/// Reads `library_index.json` without loading the per-source manifests.
pub async fn read_library_summary(root: impl AsRef<Path>) -> Result<LibrarySummary, IndexError> {
    let path = root.as_ref().join(LIBRARY_MANIFEST);
    let text = fs::read_to_string(&path)
        .await
        .map_err(|e| IndexError::io(&path, e))?;
    serde_json::from_str(&text).map_err(|e| IndexError::corrupt(&path, e.to_string()))
}

fn path_to_manifest_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn read_source_manifest(path: &Path, source_id: &str) -> Result<SourceManifest, IndexError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    let list: Vec<LibraryIndexEntry> =
        serde_json::from_str(&text).map_err(|e| IndexError::corrupt(path, e.to_string()))?;

    let mut entries = BTreeMap::new();
    for entry in list {
        if entry.source_id != source_id {
            return Err(IndexError::corrupt(
                path,
                format!(
                    "entry `{}` claims source `{}` inside `{source_id}`",
                    entry.slug, entry.source_id
                ),
            ));
        }
        if let Some(previous) = entries.insert(entry.slug.clone(), entry) {
            return Err(IndexError::corrupt(
                path,
                format!("duplicate slug `{}`", previous.slug),
            ));
        }
    }
    Ok(SourceManifest {
        entries,
        dirty: false,
    })
}

async fn write_source_manifest(
    root: &Path,
    source_id: &str,
    manifest: &mut SourceManifest,
) -> Result<(), IndexError> {
    let path = root.join(source_id).join(SOURCE_MANIFEST);
    let list = manifest.entries.values().collect::<Vec<_>>();
    let bytes = serde_json::to_vec_pretty(&list).map_err(|e| IndexError::io(&path, e))?;
    write_atomic(&path, &bytes)
        .await
        .map_err(|e| IndexError::io(&path, format!("{e:#}")))?;
    manifest.dirty = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, day, 12, 0, 0).single().expect("ts")
    }

    fn request<'a>(slug: &'a str, body: &'a [u8]) -> UpsertRequest<'a> {
        UpsertRequest {
            source_id: "niantic",
            url: "https://pokemongolive.com/news/cd-solosis",
            slug,
            title: "Community Day: Solosis",
            published_on: NaiveDate::from_ymd_opt(2025, 9, 10),
            body,
            validators: PageValidators::default(),
        }
    }

    #[tokio::test]
    async fn upsert_decides_created_updated_unchanged() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        let slug = "2025-09-10_community-day-solosis";

        let first = index.upsert(request(slug, b"<html>v1</html>"), at(1)).await.unwrap();
        let second = index.upsert(request(slug, b"<html>v1</html>"), at(2)).await.unwrap();
        let third = index.upsert(request(slug, b"<html>v2</html>"), at(3)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(third, UpsertOutcome::Updated);
        assert_eq!(index.len(), 1);

        let entry = index.lookup("niantic", slug).expect("entry");
        assert_eq!(entry.first_seen, at(1));
        assert_eq!(entry.last_fetched, at(3));
        assert_eq!(entry.fingerprint, SnapshotStore::sha256_hex(b"<html>v2</html>"));
        assert_eq!(index.read_snapshot(entry).await.unwrap(), "<html>v2</html>");
    }

    #[tokio::test]
    async fn lookup_by_url_finds_the_filed_slug() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        index.upsert(request("2025-09-10_cd", b"1"), at(1)).await.unwrap();

        let entry = index
            .lookup_by_url("niantic", "https://pokemongolive.com/news/cd-solosis")
            .expect("entry");
        assert_eq!(entry.slug, "2025-09-10_cd");
        assert!(index
            .lookup_by_url("leekduck", "https://pokemongolive.com/news/cd-solosis")
            .is_none());
        assert!(index
            .lookup_by_url("niantic", "https://pokemongolive.com/news/other")
            .is_none());
    }

    #[tokio::test]
    async fn not_modified_keeps_snapshot_and_validators() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        let mut first = request("cd", b"<html>v1</html>");
        first.validators.etag = Some("\"v1\"".to_string());
        index.upsert(first, at(1)).await.unwrap();

        assert_eq!(
            index.mark_not_modified("niantic", "cd", at(4)),
            Some(UpsertOutcome::Unchanged)
        );
        assert_eq!(index.mark_not_modified("niantic", "missing", at(4)), None);
        assert_eq!(index.mark_not_modified("leekduck", "cd", at(4)), None);

        let window = DateWindow::month("2025-09").unwrap();
        index.commit(Some(window), at(4)).await.unwrap();
        let reloaded = LibraryIndex::load(dir.path()).await.expect("reload");
        let entry = reloaded.lookup("niantic", "cd").expect("entry");
        assert_eq!(entry.first_seen, at(1));
        assert_eq!(entry.last_fetched, at(4));
        assert_eq!(entry.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(reloaded.read_snapshot(entry).await.unwrap(), "<html>v1</html>");
    }

    #[tokio::test]
    async fn unchanged_upsert_does_not_touch_the_snapshot() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        let slug = "2025-09-10_community-day-solosis";
        index.upsert(request(slug, b"<html>v1</html>"), at(1)).await.unwrap();

        let snapshot = dir.path().join("niantic").join(format!("{slug}.html"));
        std::fs::write(&snapshot, "sentinel").unwrap();

        let outcome = index.upsert(request(slug, b"<html>v1</html>"), at(2)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&snapshot).unwrap(), "sentinel");
    }

    #[tokio::test]
    async fn committed_index_reloads_identically() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        index.upsert(request("a", b"1"), at(1)).await.unwrap();
        index.upsert(request("b", b"2"), at(1)).await.unwrap();
        index.upsert(request("a", b"1"), at(5)).await.unwrap();
        let window = DateWindow::month("2025-09").unwrap();
        let summary = index.commit(Some(window), at(5)).await.unwrap();
        assert_eq!(summary.counts.get("niantic"), Some(&2));

        let reloaded = LibraryIndex::load(dir.path()).await.expect("reload");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("niantic", "a").unwrap().last_fetched, at(5));

        let on_disk = read_library_summary(dir.path()).await.unwrap();
        assert_eq!(on_disk, summary);
        assert_eq!(
            on_disk.coverage["niantic"].earliest,
            NaiveDate::from_ymd_opt(2025, 9, 10)
        );
    }

    #[tokio::test]
    async fn unparseable_manifest_is_corruption() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("leekduck")).unwrap();
        std::fs::write(dir.path().join("leekduck").join(SOURCE_MANIFEST), "{not json").unwrap();

        let err = LibraryIndex::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::Corruption { .. }));
    }

    #[tokio::test]
    async fn duplicate_slugs_in_manifest_are_corruption() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        index.upsert(request("a", b"1"), at(1)).await.unwrap();
        let entry = index.lookup("niantic", "a").unwrap().clone();
        let doubled = serde_json::to_string(&vec![entry.clone(), entry]).unwrap();
        std::fs::write(dir.path().join("niantic").join(SOURCE_MANIFEST), doubled).unwrap();

        let err = LibraryIndex::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::Corruption { .. }));
    }

    #[tokio::test]
    async fn scan_filters_by_window_and_keeps_undated() {
        let dir = tempdir().expect("tempdir");
        let mut index = LibraryIndex::load(dir.path()).await.expect("load");
        index.upsert(request("sept", b"1"), at(1)).await.unwrap();
        let mut october = request("oct", b"2");
        october.published_on = NaiveDate::from_ymd_opt(2025, 10, 2);
        index.upsert(october, at(1)).await.unwrap();
        let mut undated = request("undated", b"3");
        undated.published_on = None;
        index.upsert(undated, at(1)).await.unwrap();

        let window = DateWindow::month("2025-09").unwrap();
        let slugs = index
            .scan(Some(&window))
            .into_iter()
            .map(|e| e.slug.as_str())
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["sept", "undated"]);
        assert_eq!(index.scan(None).len(), 3);
    }
}
