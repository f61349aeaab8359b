//! On-disk TTL cache with compressed entries and batched writes.
//!
//! Each namespace lives in memory as a set of sharded maps and is persisted
//! to a single JSON file. `put` only stages; staged entries reach disk on
//! `flush`, which runs when the staged count reaches the threshold, on the
//! background flusher's interval, and explicitly before shutdown.

pub mod entry;

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use mockable::Clock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
pub use entry::CacheEntry;
use entry::StoredEntry;

const SHARDS: usize = 16;
const FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cache entry: {0}")]
    Encode(String),
    #[error("failed to decode cache entry: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub staged: usize,
    /// Compressed payload bytes held in memory.
    pub bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

type Shard = RwLock<HashMap<String, CacheEntry>>;

pub struct TtlCache {
    namespace: String,
    path: Option<PathBuf>,
    shards: Vec<Shard>,
    clock: Arc<dyn Clock>,
    flush_threshold: usize,
    staged: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
}

impl TtlCache {
    fn empty(
        namespace: &str,
        path: Option<PathBuf>,
        flush_threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            path,
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            clock,
            flush_threshold: flush_threshold.max(1),
            staged: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Memory-only cache; `flush` is a no-op.
    pub fn in_memory(namespace: &str, clock: Arc<dyn Clock>) -> Self {
        Self::empty(namespace, None, usize::MAX, clock)
    }

    /// Load `<dir>/<namespace>.cache`, discarding unreadable and expired
    /// entries. A missing or unparseable file yields an empty cache.
    pub async fn open(
        namespace: &str,
        dir: &Path,
        flush_threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let path = dir.join(format!("{namespace}.cache"));
        let cache = Self::empty(namespace, Some(path.clone()), flush_threshold, clock);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!(namespace, error = %e, "cache file unreadable, starting empty");
                cache.staged.store(1, Ordering::SeqCst);
                return Ok(cache);
            }
        };

        let mut discarded = 0usize;
        for (key, raw) in file.entries {
            let decoded = serde_json::from_value::<StoredEntry>(raw)
                .map_err(|e| CacheError::Decode(e.to_string()))
                .and_then(CacheEntry::from_stored);
            match decoded {
                Ok(entry) => {
                    cache.write_shard(&key).insert(key, entry);
                }
                Err(e) => {
                    debug!(namespace, key, error = %e, "discarding corrupt cache entry");
                    discarded += 1;
                }
            }
        }
        let expired = cache.sweep_expired();
        if discarded > 0 {
            cache.staged.fetch_add(1, Ordering::SeqCst);
        }
        info!(
            namespace,
            entries = cache.len(),
            expired,
            discarded,
            "cache loaded"
        );
        Ok(cache)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fresh value for `key`. Expired or undecodable entries count as misses
    /// and are removed.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.utc();
        let entry = self.read_shard(key).get(key).cloned();
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired(now) {
            self.remove_if_same(key, &entry);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match entry.decode() {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                warn!(namespace = %self.namespace, key, error = %e, "corrupt cache entry discarded");
                self.remove_if_same(key, &entry);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stage `value` under `key`. Flushes when the staged count reaches the
    /// configured threshold.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::encode(value, self.clock.utc(), ttl)?;
        self.write_shard(key).insert(key.to_string(), entry);
        let staged = self.staged.fetch_add(1, Ordering::SeqCst) + 1;
        if self.path.is_some() && staged >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.write_shard(key).remove(key).is_some();
        if removed {
            self.staged.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.utc();
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            removed += before - map.len();
        }
        if removed > 0 {
            self.staged.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Write all entries to disk atomically (temp file, then rename).
    pub async fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;
        let staged = self.staged.swap(0, Ordering::SeqCst);
        if staged == 0 {
            return Ok(());
        }

        let mut entries = BTreeMap::new();
        for shard in &self.shards {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (key, entry) in map.iter() {
                let stored = serde_json::to_value(entry.to_stored())
                    .map_err(|e| CacheError::Encode(e.to_string()))?;
                entries.insert(key.clone(), stored);
            }
        }
        let count = entries.len();
        let file = CacheFile {
            version: FILE_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| CacheError::Encode(e.to_string()))?;

        let tmp = path.with_extension("cache.tmp");
        let written = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = written {
            // Keep the batch staged so the next flush retries it.
            self.staged.fetch_add(staged, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!(namespace = %self.namespace, entries = count, staged, "cache flushed");
        Ok(())
    }

    /// Periodically flush staged writes until the returned handle is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = cache.flush().await {
                    warn!(namespace = %cache.namespace, error = %e, "background cache flush failed");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            staged: self.staged.load(Ordering::SeqCst),
            bytes: self
                .shards
                .iter()
                .map(|s| {
                    s.read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .values()
                        .map(CacheEntry::compressed_len)
                        .sum::<usize>()
                })
                .sum(),
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_same(&self, key: &str, seen: &CacheEntry) {
        let mut map = self.write_shard(key);
        // A concurrent put may have replaced the entry since it was read.
        let same = map
            .get(key)
            .is_some_and(|current| current.stored_at == seen.stored_at);
        if same {
            map.remove(key);
            self.staged.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    fn read_shard(&self, key: &str) -> std::sync::RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.shard_for(key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(
        &self,
        key: &str,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.shard_for(key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The cache namespaces used by one run.
#[derive(Clone)]
pub struct CacheSet {
    pub esi: Arc<TtlCache>,
    pub locations: Arc<TtlCache>,
    pub structures: Arc<TtlCache>,
    pub contract_items: Arc<TtlCache>,
}

impl CacheSet {
    pub async fn open(cfg: &Config, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let dir = cfg.cache_dir();
        let threshold = cfg.cache.flush_threshold;
        Ok(Self {
            esi: Arc::new(TtlCache::open("esi", &dir, threshold, clock.clone()).await?),
            locations: Arc::new(TtlCache::open("locations", &dir, threshold, clock.clone()).await?),
            structures: Arc::new(
                TtlCache::open("structures", &dir, threshold, clock.clone()).await?,
            ),
            contract_items: Arc::new(
                TtlCache::open("contract_items", &dir, threshold, clock).await?,
            ),
        })
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            esi: Arc::new(TtlCache::in_memory("esi", clock.clone())),
            locations: Arc::new(TtlCache::in_memory("locations", clock.clone())),
            structures: Arc::new(TtlCache::in_memory("structures", clock.clone())),
            contract_items: Arc::new(TtlCache::in_memory("contract_items", clock)),
        }
    }

    fn all(&self) -> [&Arc<TtlCache>; 4] {
        [&self.esi, &self.locations, &self.structures, &self.contract_items]
    }

    /// Flush every namespace, logging failures. Returns false if any failed.
    pub async fn flush_all(&self) -> bool {
        let mut ok = true;
        for cache in self.all() {
            if let Err(e) = cache.flush().await {
                warn!(namespace = cache.namespace(), error = %e, "cache flush failed");
                ok = false;
            }
        }
        ok
    }

    pub fn spawn_flushers(&self, every: Duration) -> Vec<JoinHandle<()>> {
        self.all()
            .into_iter()
            .map(|cache| cache.spawn_flusher(every))
            .collect()
    }

    pub fn log_stats(&self) {
        for cache in self.all() {
            let stats = cache.stats();
            info!(
                namespace = cache.namespace(),
                hits = stats.hits,
                misses = stats.misses,
                entries = stats.entries,
                bytes = stats.bytes,
                "cache stats"
            );
        }
    }
}
