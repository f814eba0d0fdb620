//! File-backed cache for API responses.
//!
//! Entries live under `{root}/{resource_type}/{key}.json` and carry their own
//! TTL and ETag, so callers can either serve a fresh entry directly or use a
//! stale entry's ETag for a conditional request.
//!
//! Writes are staged under `{root}/.staging` and promoted with an atomic
//! rename, so a reader sees either the previous complete entry or the new one.
//! The store keeps an in-memory size index and evicts the oldest entries (by
//! `cached_at`) when a write would push it past its byte budget.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// TTLs (in seconds) used by the extraction pipeline.
pub mod ttl {
    /// Never expires. Used for immutable resources (commit details, closed PRs).
    pub const PERMANENT: u64 = 0;
    /// Organization repository listings.
    pub const ORG_REPOS: u64 = 6 * 60 * 60;
    /// Pull request details while the PR is still open.
    pub const OPEN_PULL: u64 = 24 * 60 * 60;
    /// Commit and pull request list pages, revalidated by ETag once stale.
    pub const LIST_PAGE: u64 = 60 * 60;
}

const STAGING_DIR: &str = ".staging";

/// The kind of API resource a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    OrgRepos,
    CommitPages,
    CommitDetail,
    PullPages,
    PullDetail,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::OrgRepos,
        ResourceType::CommitPages,
        ResourceType::CommitDetail,
        ResourceType::PullPages,
        ResourceType::PullDetail,
    ];

    /// Directory name for this resource type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::OrgRepos => "org_repos",
            ResourceType::CommitPages => "commit_pages",
            ResourceType::CommitDetail => "commit_detail",
            ResourceType::PullPages => "pull_pages",
            ResourceType::PullDetail => "pull_detail",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while writing to the cache.
///
/// Read failures never surface as errors; they are reported as misses.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// A cached API response as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cached_at: DateTime<Utc>,
    /// Seconds until the entry goes stale. `0` means it never does.
    pub ttl_seconds: u64,
    pub etag: Option<String>,
    pub data: serde_json::Value,
}

impl CacheEntry {
    /// Whether this entry can be served without contacting the API at `now`.
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return true;
        }
        let Some(ttl) = i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
        else {
            return true;
        };
        now - self.cached_at < ttl
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    /// The cached payload, present for both fresh and stale entries.
    pub data: Option<serde_json::Value>,
    /// ETag recorded with the payload.
    pub etag: Option<String>,
    /// True only when the entry is fresh.
    pub hit: bool,
}

impl CacheLookup {
    #[must_use]
    pub fn miss() -> Self {
        Self::default()
    }

    /// A stale entry that can be revalidated with a conditional request.
    #[must_use]
    pub fn revalidation_etag(&self) -> Option<&str> {
        if self.hit || self.data.is_none() {
            None
        } else {
            self.etag.as_deref()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexedEntry {
    size: u64,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<PathBuf, IndexedEntry>,
    total_bytes: u64,
}

impl CacheIndex {
    fn insert(&mut self, path: PathBuf, entry: IndexedEntry) {
        if let Some(old) = self.entries.insert(path, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size);
        }
        self.total_bytes += entry.size;
    }

    fn remove(&mut self, path: &Path) -> Option<IndexedEntry> {
        let removed = self.entries.remove(path)?;
        self.total_bytes = self.total_bytes.saturating_sub(removed.size);
        Some(removed)
    }

    /// Drop the oldest entries until `incoming` more bytes fit in `max_bytes`.
    fn evict_for(&mut self, incoming: u64, max_bytes: u64) -> Vec<PathBuf> {
        if self.total_bytes + incoming <= max_bytes {
            return Vec::new();
        }

        let mut by_age: Vec<(DateTime<Utc>, PathBuf)> = self
            .entries
            .iter()
            .map(|(path, e)| (e.cached_at, path.clone()))
            .collect();
        by_age.sort();

        let mut victims = Vec::new();
        for (_, path) in by_age {
            if self.total_bytes + incoming <= max_bytes {
                break;
            }
            self.remove(&path);
            victims.push(path);
        }
        victims
    }
}

/// Durable, TTL-aware key/value store for API responses.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    staging: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
}

impl CacheStore {
    /// Open (or create) a cache rooted at `root` with a total size budget.
    ///
    /// Leftover staging files from an interrupted run are removed and the size
    /// index is rebuilt from the entries on disk.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| CacheError::io(&staging, e))?;

        let store = Self {
            root,
            staging,
            max_bytes,
            index: Mutex::new(CacheIndex::default()),
        };

        let swept = store.discard_staged().await?;
        if swept > 0 {
            tracing::debug!(swept, "Removed leftover staged cache writes");
        }
        store.rebuild_index().await?;
        Ok(store)
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Total bytes currently tracked by the size index.
    pub fn total_bytes(&self) -> u64 {
        self.lock_index().total_bytes
    }

    /// Look up an entry.
    ///
    /// Missing, unreadable, and corrupt entries are all reported as a miss.
    pub async fn get(&self, resource: ResourceType, key: &str) -> CacheLookup {
        match self.read_entry(resource, key).await {
            Some(entry) => CacheLookup {
                hit: entry.is_fresh_at(Utc::now()),
                etag: entry.etag,
                data: Some(entry.data),
            },
            None => CacheLookup::miss(),
        }
    }

    /// Store an entry, replacing any previous value for the key.
    pub async fn put(
        &self,
        resource: ResourceType,
        key: &str,
        data: serde_json::Value,
        ttl_seconds: u64,
        etag: Option<String>,
    ) -> Result<()> {
        let entry = CacheEntry {
            cached_at: Utc::now(),
            ttl_seconds,
            etag,
            data,
        };
        self.write_entry(resource, key, &entry).await
    }

    /// Refresh `cached_at` for an existing entry without touching its data.
    ///
    /// Returns `false` when there was no readable entry to refresh.
    pub async fn touch(&self, resource: ResourceType, key: &str) -> Result<bool> {
        let Some(mut entry) = self.read_entry(resource, key).await else {
            return Ok(false);
        };
        entry.cached_at = Utc::now();
        self.write_entry(resource, key, &entry).await?;
        Ok(true)
    }

    /// Remove an entry. Returns whether one existed.
    pub async fn invalidate(&self, resource: ResourceType, key: &str) -> Result<bool> {
        let path = self.entry_path(resource, key);
        self.lock_index().remove(&path);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Delete staged writes that were never promoted.
    pub async fn discard_staged(&self) -> Result<usize> {
        let mut dir = match fs::read_dir(&self.staging).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(&self.staging, e)),
        };

        let mut removed = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.staging, e))?
        {
            let path = item.path();
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    /// Remove every entry of every resource type.
    pub async fn clear(&self) -> Result<()> {
        for resource in ResourceType::ALL {
            let dir = self.root.join(resource.as_str());
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&dir, e)),
            }
        }
        *self.lock_index() = CacheIndex::default();
        Ok(())
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_path(&self, resource: ResourceType, key: &str) -> PathBuf {
        let mut path = self.root.join(resource.as_str());
        let segments: Vec<String> = key.split('/').map(sanitize_segment).collect();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(dir);
            }
            path.push(format!("{last}.json"));
        }
        path
    }

    async fn read_entry(&self, resource: ResourceType, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(resource, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Unreadable cache entry");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Corrupt cache entry, treating as miss");
                None
            }
        }
    }

    async fn write_entry(
        &self,
        resource: ResourceType,
        key: &str,
        entry: &CacheEntry,
    ) -> Result<()> {
        let path = self.entry_path(resource, key);
        let bytes = serde_json::to_vec(entry)?;
        let size = bytes.len() as u64;

        let victims = {
            let mut index = self.lock_index();
            index.remove(&path);
            let victims = index.evict_for(size, self.max_bytes);
            index.insert(
                path.clone(),
                IndexedEntry {
                    size,
                    cached_at: entry.cached_at,
                },
            );
            victims
        };

        for victim in &victims {
            match fs::remove_file(victim).await {
                Ok(()) => tracing::debug!(path = %victim.display(), "Evicted cache entry"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %victim.display(), error = %e, "Failed to evict cache entry"),
            }
        }

        let result = self.stage_and_promote(&path, &bytes).await;
        if result.is_err() {
            self.lock_index().remove(&path);
        }
        result
    }

    async fn stage_and_promote(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let staged = self.staging.join(format!("{}.tmp", Uuid::new_v4()));

        let write = async {
            let mut file = fs::File::create(&staged).await?;
            file.write_all(bytes).await?;
            file.sync_all().await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&staged).await;
            return Err(CacheError::io(&staged, e));
        }

        if let Some(parent) = path.parent()
            && let Err(e) = fs::create_dir_all(parent).await
        {
            let _ = fs::remove_file(&staged).await;
            return Err(CacheError::io(parent, e));
        }

        if let Err(e) = fs::rename(&staged, path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(CacheError::io(path, e));
        }
        Ok(())
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut index = CacheIndex::default();

        for resource in ResourceType::ALL {
            let mut pending = vec![self.root.join(resource.as_str())];
            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(CacheError::io(&dir, e)),
                };

                while let Some(item) = entries
                    .next_entry()
                    .await
                    .map_err(|e| CacheError::io(&dir, e))?
                {
                    let path = item.path();
                    let meta = item
                        .metadata()
                        .await
                        .map_err(|e| CacheError::io(&path, e))?;
                    if meta.is_dir() {
                        pending.push(path);
                        continue;
                    }

                    // Unparsable entries sort first so they are evicted before anything useful.
                    let cached_at = match fs::read(&path).await {
                        Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                            .map(|e| e.cached_at)
                            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                        Err(_) => DateTime::<Utc>::UNIX_EPOCH,
                    };
                    index.insert(
                        path,
                        IndexedEntry {
                            size: meta.len(),
                            cached_at,
                        },
                    );
                }
            }
        }

        tracing::debug!(
            entries = index.entries.len(),
            total_bytes = index.total_bytes,
            "Loaded cache index"
        );
        *self.lock_index() = index;
        Ok(())
    }
}

/// Make a key segment safe to use as a path component.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}
