//! Snapshot storage, the library index, and HTTP fetch utilities.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod fetch;
mod index;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage, FixtureFetcher,
    HttpClientConfig, HttpFetcher, PageFetcher, RequestSpacing, RetryDisposition, FIXTURE_ROUTES,
};
pub use index::{
    read_library_summary, IndexError, LibraryIndex, LibrarySummary, SourceCoverage, UpsertRequest,
    LIBRARY_MANIFEST, SOURCE_MANIFEST,
};

pub const CRATE_NAME: &str = "pogo-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub fingerprint: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Raw page markup laid out as `<root>/<source>/<slug>.html`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(&self, source_id: &str, slug: &str) -> PathBuf {
        PathBuf::from(source_id).join(format!("{slug}.html"))
    }

    /// Writes (or replaces) the snapshot for `slug` via temp file + rename.
    pub async fn write_snapshot(
        &self,
        source_id: &str,
        slug: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let relative_path = self.snapshot_relative_path(source_id, slug);
        let absolute_path = self.root.join(&relative_path);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredSnapshot {
            fingerprint: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn read_snapshot(&self, relative_path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path.as_ref());
        fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))
    }
}

/// Replace `path` with `bytes` so readers only ever see the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable_sha256() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshot_replace_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let first = store
            .write_snapshot("niantic", "2025-09-10_cd", b"<html>v1</html>")
            .await
            .expect("first write");
        let second = store
            .write_snapshot("niantic", "2025-09-10_cd", b"<html>v2</html>")
            .await
            .expect("second write");

        assert_eq!(first.relative_path, PathBuf::from("niantic/2025-09-10_cd.html"));
        assert_eq!(first.relative_path, second.relative_path);
        assert_ne!(first.fingerprint, second.fingerprint);
        let body = store.read_snapshot(&second.relative_path).await.expect("read");
        assert_eq!(body, b"<html>v2</html>");

        let leftovers = std::fs::read_dir(dir.path().join("niantic"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
