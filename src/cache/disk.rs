use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::cache::{is_expired, CacheEntry, CacheStats, Clock, ResultCache, SystemClock};
use crate::core::{QueryFingerprint, QueryResult};
use crate::error::CacheError;

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const INDEX_VERSION: u32 = 1;

/// Disk-backed result cache
///
/// Layout under the cache directory:
/// ```text
/// index.json                 fingerprint -> {created_at, ttl, size_bytes}, insertion ordered
/// blobs/<fingerprint>.json   one serialized CacheEntry per fingerprint
/// ```
///
/// Blobs are written before the index and both go through a temp file plus
/// rename, so a crash never leaves a torn index. An unreadable index is
/// rebuilt from the blob directory with every recovered entry marked expired.
///
/// Blob writes run outside the index lock. A fingerprint with a write in
/// flight keeps its blob file when its old index entry is dropped.
pub struct DiskCache {
    root: PathBuf,
    blob_dir: PathBuf,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    index: Mutex<CacheIndex>,
    tmp_counter: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    fingerprint: QueryFingerprint,
    created_at: DateTime<Utc>,
    ttl: Duration,
    size_bytes: u64,
}

impl IndexEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.created_at, self.ttl, now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<QueryFingerprint, IndexEntry>,
    order: VecDeque<QueryFingerprint>,
    writes_in_flight: HashMap<QueryFingerprint, usize>,
}

impl CacheIndex {
    fn begin_write(&mut self, fingerprint: &QueryFingerprint) {
        *self.writes_in_flight.entry(fingerprint.clone()).or_insert(0) += 1;
    }

    fn end_write(&mut self, fingerprint: &QueryFingerprint) {
        if let Some(n) = self.writes_in_flight.get_mut(fingerprint) {
            *n -= 1;
            if *n == 0 {
                self.writes_in_flight.remove(fingerprint);
            }
        }
    }

    fn is_writing(&self, fingerprint: &QueryFingerprint) -> bool {
        self.writes_in_flight.contains_key(fingerprint)
    }

    /// Insert (or replace) an entry, returning fingerprints evicted for room
    fn insert(&mut self, entry: IndexEntry, capacity: usize) -> Vec<QueryFingerprint> {
        let fingerprint = entry.fingerprint.clone();
        self.remove(&fingerprint);

        let mut evicted = Vec::new();
        while self.entries.len() >= capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }

        self.order.push_back(fingerprint.clone());
        self.entries.insert(fingerprint, entry);
        evicted
    }

    fn remove(&mut self, fingerprint: &QueryFingerprint) -> Option<IndexEntry> {
        let removed = self.entries.remove(fingerprint)?;
        self.order.retain(|f| f != fingerprint);
        Some(removed)
    }

    fn expired(&self, now: DateTime<Utc>) -> Vec<QueryFingerprint> {
        self.order
            .iter()
            .filter(|f| self.entries.get(*f).map_or(false, |e| e.is_expired_at(now)))
            .cloned()
            .collect()
    }

    fn to_file(&self) -> IndexFile {
        IndexFile {
            version: INDEX_VERSION,
            entries: self
                .order
                .iter()
                .filter_map(|f| self.entries.get(f).cloned())
                .collect(),
        }
    }
}

impl DiskCache {
    /// Open (or create) a cache directory using the system clock
    pub async fn open(root: impl AsRef<Path>, ttl: Duration, capacity: usize) -> Result<Self, CacheError> {
        Self::open_with_clock(root, ttl, capacity, Arc::new(SystemClock)).await
    }

    /// Open (or create) a cache directory with an explicit time source
    pub async fn open_with_clock(
        root: impl AsRef<Path>,
        ttl: Duration,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let blob_dir = root.join(BLOB_DIR);
        tokio::fs::create_dir_all(&blob_dir).await?;

        let blobs = scan_blobs(&blob_dir).await?;
        let now = clock.now();

        let (index, dirty) = match load_index(&root.join(INDEX_FILE)).await {
            Ok(Some(file)) => reconcile(file.entries, &blobs, now),
            Ok(None) => reconcile(Vec::new(), &blobs, now),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Cache index unreadable ({}), rebuilding from {} blobs",
                    e,
                    blobs.len()
                );
                let (index, _) = reconcile(Vec::new(), &blobs, now);
                (index, true)
            }
        };

        let cache = Self {
            root,
            blob_dir,
            ttl,
            capacity: capacity.max(1),
            clock,
            index: Mutex::new(CacheIndex::default()),
            tmp_counter: AtomicU64::new(0),
        };

        if dirty {
            cache.persist_index(&index).await?;
        }

        tracing::info!(
            "📦 Result cache opened at {} ({} entries, ttl={}s, capacity={})",
            cache.root.display(),
            index.entries.len(),
            ttl.as_secs(),
            cache.capacity
        );

        *cache.index.lock().await = index;
        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn blob_path(&self, fingerprint: &QueryFingerprint) -> PathBuf {
        self.blob_dir.join(format!("{}.json", fingerprint))
    }

    async fn persist_index(&self, index: &CacheIndex) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(&index.to_file())?;
        self.write_atomic(&self.root.join(INDEX_FILE), &bytes).await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CacheError::Corrupt(format!("invalid cache path {}", path.display())))?;
        let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, n));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_blob(&self, fingerprint: &QueryFingerprint) -> Result<CacheEntry, CacheError> {
        let bytes = tokio::fs::read(self.blob_path(fingerprint)).await?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.fingerprint != *fingerprint {
            return Err(CacheError::Corrupt(format!(
                "blob {} holds entry for {}",
                fingerprint.short(),
                entry.fingerprint.short()
            )));
        }
        Ok(entry)
    }

    /// Delete the blob of an entry just dropped from `index`, unless a put for
    /// the same fingerprint is still writing its replacement
    async fn discard_blob(&self, index: &CacheIndex, fingerprint: &QueryFingerprint) {
        if index.is_writing(fingerprint) {
            tracing::debug!("Keeping blob {} for in-flight write", fingerprint.short());
            return;
        }
        self.remove_blob(fingerprint).await;
    }

    async fn remove_blob(&self, fingerprint: &QueryFingerprint) {
        match tokio::fs::remove_file(self.blob_path(fingerprint)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove cache blob {}: {}", fingerprint.short(), e),
        }
    }
}

#[async_trait]
impl ResultCache for DiskCache {
    async fn get(&self, fingerprint: &QueryFingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();

        let seen_created_at = {
            let mut index = self.index.lock().await;
            let Some((expired, created_at)) = index
                .entries
                .get(fingerprint)
                .map(|meta| (meta.is_expired_at(now), meta.created_at))
            else {
                return Ok(None);
            };

            if expired {
                index.remove(fingerprint);
                self.discard_blob(&index, fingerprint).await;
                self.persist_index(&index).await?;
                tracing::debug!("Cache entry {} expired", fingerprint.short());
                return Ok(None);
            }
            created_at
        };

        match self.read_blob(fingerprint).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Dropping unreadable cache entry {}: {}", fingerprint.short(), e);
                let mut index = self.index.lock().await;
                let unchanged = index
                    .entries
                    .get(fingerprint)
                    .map_or(false, |meta| meta.created_at == seen_created_at);
                if unchanged {
                    index.remove(fingerprint);
                    self.discard_blob(&index, fingerprint).await;
                    self.persist_index(&index).await?;
                }
                Ok(None)
            }
        }
    }

    async fn put(&self, fingerprint: &QueryFingerprint, result: &QueryResult) -> Result<(), CacheError> {
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            result: result.clone(),
            created_at: self.clock.now(),
            ttl: self.ttl,
        };
        let bytes = serde_json::to_vec(&entry)?;

        // Blob first: an index entry must never point at a missing blob
        self.index.lock().await.begin_write(fingerprint);
        let written = self.write_atomic(&self.blob_path(fingerprint), &bytes).await;

        let mut index = self.index.lock().await;
        index.end_write(fingerprint);
        written?;

        let evicted = index.insert(
            IndexEntry {
                fingerprint: fingerprint.clone(),
                created_at: entry.created_at,
                ttl: entry.ttl,
                size_bytes: bytes.len() as u64,
            },
            self.capacity,
        );
        for old in &evicted {
            self.discard_blob(&index, old).await;
        }
        self.persist_index(&index).await?;

        if !evicted.is_empty() {
            tracing::debug!("Evicted {} cache entries for capacity", evicted.len());
        }
        Ok(())
    }

    async fn invalidate_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut index = self.index.lock().await;

        let expired = index.expired(now);
        if expired.is_empty() {
            return Ok(0);
        }

        for fingerprint in &expired {
            index.remove(fingerprint);
            self.discard_blob(&index, fingerprint).await;
        }
        self.persist_index(&index).await?;

        tracing::info!("🧹 Removed {} expired cache entries", expired.len());
        Ok(expired.len())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = self.clock.now();
        let index = self.index.lock().await;

        Ok(CacheStats {
            total_entries: index.entries.len(),
            expired_entries: index.entries.values().filter(|e| e.is_expired_at(now)).count(),
            total_bytes: index.entries.values().map(|e| e.size_bytes).sum(),
            oldest_entry: index.entries.values().map(|e| e.created_at).min(),
            newest_entry: index.entries.values().map(|e| e.created_at).max(),
        })
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut index = self.index.lock().await;
        let all: Vec<QueryFingerprint> = index.order.iter().cloned().collect();
        for fingerprint in &all {
            self.discard_blob(&index, fingerprint).await;
        }
        index.entries.clear();
        index.order.clear();
        self.persist_index(&index).await
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let index = self.index.lock().await;
        self.persist_index(&index).await
    }
}

async fn load_index(path: &Path) -> Result<Option<IndexFile>, CacheError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file: IndexFile = serde_json::from_slice(&bytes)?;
    if file.version != INDEX_VERSION {
        return Err(CacheError::Corrupt(format!(
            "unsupported index version {}",
            file.version
        )));
    }
    Ok(Some(file))
}

/// Blob fingerprints and sizes; stale temp files are removed on the way
async fn scan_blobs(dir: &Path) -> Result<HashMap<QueryFingerprint, u64>, CacheError> {
    let mut blobs = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(".tmp") {
            let _ = tokio::fs::remove_file(&path).await;
            continue;
        }

        let fingerprint = name
            .strip_suffix(".json")
            .and_then(QueryFingerprint::from_hex);
        if let Some(fingerprint) = fingerprint {
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            blobs.insert(fingerprint, size);
        }
    }

    Ok(blobs)
}

/// Keep indexed entries that still have a blob; adopt orphan blobs as expired
fn reconcile(
    indexed: Vec<IndexEntry>,
    blobs: &HashMap<QueryFingerprint, u64>,
    now: DateTime<Utc>,
) -> (CacheIndex, bool) {
    let mut index = CacheIndex::default();
    let mut dirty = false;

    for entry in indexed {
        if blobs.contains_key(&entry.fingerprint) {
            index.insert(entry, usize::MAX);
        } else {
            dirty = true;
        }
    }

    let mut orphans: Vec<(&QueryFingerprint, &u64)> = blobs
        .iter()
        .filter(|(f, _)| !index.entries.contains_key(*f))
        .collect();
    orphans.sort();

    for (fingerprint, size) in orphans {
        index.insert(
            IndexEntry {
                fingerprint: fingerprint.clone(),
                created_at: now,
                ttl: Duration::ZERO,
                size_bytes: *size,
            },
            usize::MAX,
        );
        dirty = true;
    }

    (index, dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::core::{ResultMetadata, Row, Value};

    fn sample_result(id: &str) -> QueryResult {
        let mut row = Row::new();
        row.insert("product_id".to_string(), Value::from(id));
        row.insert("current_price".to_string(), Value::from(12.5));
        QueryResult::success(
            vec!["product_id".into(), "current_price".into()],
            vec![row],
            Duration::from_millis(4),
            ResultMetadata::new("test", "sqlite"),
        )
    }

    async fn open_cache(dir: &Path, capacity: usize) -> (DiskCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = DiskCache::open_with_clock(dir, Duration::from_secs(60), capacity, clock.clone())
            .await
            .unwrap();
        (cache, clock)
    }

    #[tokio::test]
    async fn test_cache_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 10).await;
        let fp = QueryFingerprint::compute("SELECT 1");

        cache.put(&fp, &sample_result("1")).await.unwrap();

        let entry = cache.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.fingerprint, fp);
        assert_eq!(entry.result.rows, sample_result("1").rows);
        assert!(dir.path().join("blobs").join(format!("{}.json", fp)).exists());
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 10).await;
        assert!(cache.get(&QueryFingerprint::compute("SELECT 2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_ttl_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock) = open_cache(dir.path(), 10).await;
        let fp = QueryFingerprint::compute("SELECT 1");
        cache.put(&fp, &sample_result("1")).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(cache.get(&fp).await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get(&fp).await.unwrap().is_none());

        // Purged on lookup
        assert_eq!(cache.stats().await.unwrap().total_entries, 0);
        assert!(!dir.path().join("blobs").join(format!("{}.json", fp)).exists());
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 2).await;
        let a = QueryFingerprint::compute("SELECT 'a'");
        let b = QueryFingerprint::compute("SELECT 'b'");
        let c = QueryFingerprint::compute("SELECT 'c'");

        cache.put(&a, &sample_result("a")).await.unwrap();
        cache.put(&b, &sample_result("b")).await.unwrap();
        // Reads do not refresh insertion order
        assert!(cache.get(&a).await.unwrap().is_some());
        cache.put(&c, &sample_result("c")).await.unwrap();

        assert!(cache.get(&a).await.unwrap().is_none());
        assert!(cache.get(&b).await.unwrap().is_some());
        assert!(cache.get(&c).await.unwrap().is_some());
        assert_eq!(cache.stats().await.unwrap().total_entries, 2);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fp = QueryFingerprint::compute("SELECT 1");
        {
            let (cache, _) = open_cache(dir.path(), 10).await;
            cache.put(&fp, &sample_result("1")).await.unwrap();
            cache.flush().await.unwrap();
        }

        let (cache, _) = open_cache(dir.path(), 10).await;
        assert!(cache.get(&fp).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_index_is_rebuilt_as_expired() {
        let dir = tempfile::tempdir().unwrap();
        let fp = QueryFingerprint::compute("SELECT 1");
        {
            let (cache, _) = open_cache(dir.path(), 10).await;
            cache.put(&fp, &sample_result("1")).await.unwrap();
        }
        std::fs::write(dir.path().join(INDEX_FILE), b"{ not json").unwrap();

        let (cache, _) = open_cache(dir.path(), 10).await;
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        assert!(cache.get(&fp).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 10).await;
        let fp = QueryFingerprint::compute("SELECT 1");
        cache.put(&fp, &sample_result("1")).await.unwrap();

        std::fs::write(dir.path().join("blobs").join(format!("{}.json", fp)), b"garbage").unwrap();

        assert!(cache.get(&fp).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_invalidate_expired() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock) = open_cache(dir.path(), 10).await;
        let old = QueryFingerprint::compute("SELECT 'old'");
        let fresh = QueryFingerprint::compute("SELECT 'fresh'");

        cache.put(&old, &sample_result("old")).await.unwrap();
        clock.advance(Duration::from_secs(45));
        cache.put(&fresh, &sample_result("fresh")).await.unwrap();
        clock.advance(Duration::from_secs(30));

        assert_eq!(cache.invalidate_expired().await.unwrap(), 1);
        assert!(cache.get(&fresh).await.unwrap().is_some());
        assert_eq!(cache.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_cache_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 10).await;
        let fp = QueryFingerprint::compute("SELECT 1");
        cache.put(&fp, &sample_result("1")).await.unwrap();

        cache.clear().await.unwrap();

        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());
        assert!(cache.get(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_blob_of_in_flight_write() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 1).await;
        let f = QueryFingerprint::compute("SELECT 'f'");
        let g = QueryFingerprint::compute("SELECT 'g'");
        cache.put(&f, &sample_result("f")).await.unwrap();

        // A second put of `f` has written its blob but not yet indexed it
        cache.index.lock().await.begin_write(&f);
        cache.put(&g, &sample_result("g")).await.unwrap();
        assert!(cache.blob_path(&f).exists());

        cache.index.lock().await.end_write(&f);
        cache.put(&f, &sample_result("f2")).await.unwrap();
        let entry = cache.get(&f).await.unwrap().unwrap();
        assert_eq!(entry.result.rows, sample_result("f2").rows);
    }

    #[tokio::test]
    async fn test_concurrent_puts_leave_no_dangling_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = open_cache(dir.path(), 1).await;
        let cache = Arc::new(cache);
        let fingerprints: Vec<QueryFingerprint> = (0..3)
            .map(|i| QueryFingerprint::compute(&format!("SELECT {}", i)))
            .collect();

        let mut handles = Vec::new();
        for round in 0..30 {
            let cache = cache.clone();
            let fp = fingerprints[round % fingerprints.len()].clone();
            handles.push(tokio::spawn(async move {
                cache.put(&fp, &sample_result("x")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let index = cache.index.lock().await;
        assert!(index.writes_in_flight.is_empty());
        for fp in index.entries.keys() {
            assert!(cache.blob_path(fp).exists(), "index entry {} has no blob", fp.short());
        }
    }
}
