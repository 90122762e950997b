use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{QueryError, QueryResult};
use crate::model::Batch;

use super::{exists_on_disk, scan_parquet_files_isolated, BackendStats, StorageBackend};

struct ListingCacheEntry {
    fetched_at: Instant,
    files: Vec<String>,
}

/// Reads partition files from a local filesystem lake.
pub struct LocalBackend {
    root: PathBuf,
    listing_ttl: Duration,
    listing_cache: Mutex<HashMap<String, ListingCacheEntry>>,
    semaphore: Arc<Semaphore>,
    files_listed: AtomicU64,
    files_read: AtomicU64,
    read_errors: AtomicU64,
    listing_cache_hits: AtomicU64,
    listing_cache_misses: AtomicU64,
}

impl LocalBackend {
    pub fn new(root: PathBuf, listing_ttl_seconds: u64, max_workers: usize) -> Self {
        Self {
            root,
            listing_ttl: Duration::from_secs(listing_ttl_seconds),
            listing_cache: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            files_listed: AtomicU64::new(0),
            files_read: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            listing_cache_hits: AtomicU64::new(0),
            listing_cache_misses: AtomicU64::new(0),
        }
    }

    pub fn clear_listing_cache(&self) {
        self.listing_cache.lock().expect("listing cache poisoned").clear();
    }
}

fn walk_parquet_files(dir: &Path, root: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_parquet_files(&path, root, out);
        } else if path.extension().map(|ext| ext == "parquet").unwrap_or(false) {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn list_files(&self, prefix: &str) -> QueryResult<Vec<String>> {
        if let Some(entry) = self.listing_cache.lock().expect("listing cache poisoned").get(prefix) {
            if entry.fetched_at.elapsed() < self.listing_ttl {
                self.listing_cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.files.clone());
            }
        }
        self.listing_cache_misses.fetch_add(1, Ordering::Relaxed);

        let root = self.root.clone();
        let prefix_owned = prefix.to_string();
        let files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let start_dir = root.join(&prefix_owned);
            if start_dir.is_dir() {
                walk_parquet_files(&start_dir, &root, &mut out);
            }
            out
        })
        .await
        .map_err(|err| QueryError::internal(format!("local listing task panicked: {err}")))?;

        self.files_listed.fetch_add(files.len() as u64, Ordering::Relaxed);
        self.listing_cache.lock().expect("listing cache poisoned").insert(
            prefix.to_string(),
            ListingCacheEntry {
                fetched_at: Instant::now(),
                files: files.clone(),
            },
        );
        Ok(files)
    }

    async fn read_parquet(&self, paths: &[String]) -> QueryResult<Batch> {
        let root = self.root.clone();
        let existing: Vec<PathBuf> = paths
            .iter()
            .map(|p| root.join(p))
            .filter(|p| p.is_file())
            .collect();
        if existing.is_empty() {
            return Ok(Batch::new());
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| QueryError::internal(format!("local read semaphore closed: {err}")))?;
        let count = existing.len() as u64;
        let (batch, failed) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            scan_parquet_files_isolated(&existing)
        })
        .await
        .map_err(|err| QueryError::internal(format!("local read task panicked: {err}")))?;

        self.files_read.fetch_add(count.saturating_sub(failed), Ordering::Relaxed);
        if failed > 0 {
            self.read_errors.fetch_add(failed, Ordering::Relaxed);
        }
        Ok(batch)
    }

    async fn file_exists(&self, path: &str) -> QueryResult<bool> {
        Ok(exists_on_disk(&self.root, path))
    }

    async fn health_check(&self) -> bool {
        self.root.is_dir()
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            files_listed: self.files_listed.load(Ordering::Relaxed),
            files_read: self.files_read.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            listing_cache_hits: self.listing_cache_hits.load(Ordering::Relaxed),
            listing_cache_misses: self.listing_cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_only_parquet_files_under_prefix() {
        let temp = tempfile::tempdir().unwrap();
        let asset_dir = temp.path().join("pump1/2024/01/01/00");
        std::fs::create_dir_all(&asset_dir).unwrap();
        std::fs::write(asset_dir.join("temp.parquet"), b"not-real-parquet").unwrap();
        std::fs::write(asset_dir.join("notes.txt"), b"ignore me").unwrap();

        let backend = LocalBackend::new(temp.path().to_path_buf(), 60, 2);
        let files = backend.list_files("pump1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("temp.parquet"));
    }

    #[tokio::test]
    async fn listing_cache_is_reused_within_ttl() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("pump1")).unwrap();
        let backend = LocalBackend::new(temp.path().to_path_buf(), 3600, 2);

        backend.list_files("pump1").await.unwrap();
        std::fs::write(temp.path().join("pump1/late.parquet"), b"x").unwrap();
        let files = backend.list_files("pump1").await.unwrap();
        assert!(files.is_empty(), "second call within TTL should hit the cache");
        assert_eq!(backend.stats().listing_cache_hits, 1);
    }

    #[tokio::test]
    async fn missing_paths_are_skipped_not_errors() {
        let temp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(temp.path().to_path_buf(), 60, 2);
        let batch = backend
            .read_parquet(&["pump1/2024/01/01/00/temp.parquet".to_string()])
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
}
