//! Whole-file listing storage + HTTP fetch utilities for decant.

mod fetch;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use decant_core::ListingRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "decant-storage";

/// In-memory listing table backed by a single JSON file.
///
/// Persistence is whole-collection: `persist_all` rewrites the entire file.
#[derive(Debug)]
pub struct ListingStore {
    path: PathBuf,
    records: Vec<ListingRecord>,
}

impl ListingStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    /// Opens the store, loading existing rows. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut store = Self::empty(path);
        store.load_all().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_all(&mut self) -> anyhow::Result<()> {
        self.records = read_rows(&self.path).await?.unwrap_or_default();
        debug!(path = %self.path.display(), rows = self.records.len(), "loaded listing store");
        Ok(())
    }

    pub async fn persist_all(&self) -> anyhow::Result<()> {
        write_rows_atomically(&self.path, &self.records).await
    }

    /// Appends without any uniqueness check on `post_id`.
    pub fn insert(&mut self, record: ListingRecord) {
        self.records.push(record);
    }

    pub fn scan<F>(&self, predicate: F) -> Vec<ListingRecord>
    where
        F: Fn(&ListingRecord) -> bool,
    {
        self.records.iter().filter(|r| predicate(*r)).cloned().collect()
    }

    /// Removes every row for `post_id`, returning how many were dropped.
    pub fn remove_by_key(&mut self, post_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.post_id != post_id);
        before - self.records.len()
    }

    pub fn records(&self) -> &[ListingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Post ids in first-appearance order.
    pub fn distinct_post_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.post_id.as_str()))
            .map(|r| r.post_id.clone())
            .collect()
    }

    fn replace_records(&mut self, records: Vec<ListingRecord>) {
        self.records = records;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub removed: usize,
    pub inserted: usize,
}

/// Shared single-writer handle. Every mutation takes the lock, applies the
/// change, and rewrites the backing file before releasing it. A failed
/// rewrite rolls the in-memory table back to its previous contents.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<ListingStore>>,
}

impl StoreHandle {
    pub fn new(store: ListingStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::new(ListingStore::open(path).await?))
    }

    /// Drops any existing rows for `post_id` and inserts `records` in their place.
    pub async fn replace_post(
        &self,
        post_id: &str,
        records: Vec<ListingRecord>,
    ) -> anyhow::Result<ReplaceOutcome> {
        let mut store = self.inner.lock().await;
        let previous = store.records().to_vec();

        let removed = store.remove_by_key(post_id);
        let inserted = records.len();
        for record in records {
            store.insert(record);
        }

        if let Err(err) = store.persist_all().await {
            store.replace_records(previous);
            return Err(err).with_context(|| format!("persisting listings for post {post_id}"));
        }
        Ok(ReplaceOutcome { removed, inserted })
    }

    /// Removes every row belonging to any of `post_ids` and persists once.
    pub async fn remove_posts(&self, post_ids: &[String]) -> anyhow::Result<usize> {
        let mut store = self.inner.lock().await;
        let previous = store.records().to_vec();

        let removed: usize = post_ids.iter().map(|id| store.remove_by_key(id)).sum();

        if let Err(err) = store.persist_all().await {
            store.replace_records(previous);
            return Err(err).context("persisting listings after removal");
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> Vec<ListingRecord> {
        self.inner.lock().await.records().to_vec()
    }

    pub async fn scan<F>(&self, predicate: F) -> Vec<ListingRecord>
    where
        F: Fn(&ListingRecord) -> bool,
    {
        self.inner.lock().await.scan(predicate)
    }

    pub async fn distinct_post_ids(&self) -> Vec<String> {
        self.inner.lock().await.distinct_post_ids()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Reads a JSON array of rows. `Ok(None)` when the file does not exist.
pub async fn read_rows<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<Vec<T>>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Some(Vec::new()));
    }
    let rows = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(rows))
}

/// Writes rows as a pretty JSON array via temp file + rename, so readers
/// never observe a half-written table.
pub async fn write_rows_atomically<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let bytes = serde_json::to_vec_pretty(rows).context("serializing rows")?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "rows".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
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
