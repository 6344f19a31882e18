//! The response cache: fingerprinted, LRU-bounded by entry count and bytes,
//! TTL'd, invalidated in (connection, database) buckets on structural
//! change, with a single-flight discipline so concurrent identical requests
//! share one database round-trip.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        LazyLock,
    },
    time::Duration,
};

use cmd_util::env::env_config;
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{
    Digest,
    Sha256,
};
use statements::{
    Filter,
    Sort,
};
use tokio::{
    sync::broadcast,
    time::Instant,
};

use crate::results::ResultPage;

static CACHE_MAX_ENTRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("DBC_CACHE_MAX_ENTRIES", 1024));

static CACHE_MAX_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("DBC_CACHE_MAX_BYTES", 64 << 20));

/// Server-side ceiling on entry lifetime; clients may ask for less.
static CACHE_TTL_CEILING: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DBC_CACHE_TTL_SECONDS", 300)));

/// Deterministic request identity. Serialization of typed fields in fixed
/// order makes the fingerprint independent of the JSON key order the client
/// happened to send.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    connection: &'a str,
    database: &'a str,
    statement: &'a str,
    params: &'a [JsonValue],
    sort: Option<&'a Sort>,
    filters: &'a [Filter],
    page: u64,
    page_size: i64,
}

#[allow(clippy::too_many_arguments)]
pub fn fingerprint(
    connection: &str,
    database: &str,
    statement: &str,
    params: &[JsonValue],
    sort: Option<&Sort>,
    filters: &[Filter],
    page: u64,
    page_size: i64,
) -> String {
    let input = FingerprintInput {
        connection,
        database,
        statement,
        params,
        sort,
        filters,
        page,
        page_size,
    };
    let bytes = serde_json::to_vec(&input).expect("fingerprint input always serializes");
    hex::encode(Sha256::digest(&bytes))
}

/// Everything the cache needs to know about one request.
pub struct CacheRequest {
    pub connection: String,
    pub database: String,
    pub fingerprint: String,
    /// Lowercased tables the statement references, for targeted
    /// `modify-data` invalidation.
    pub tables: Vec<String>,
    pub ttl_seconds: Option<u64>,
    /// `false` bypasses reads (the response is still stored).
    pub use_cache: bool,
    /// Only successful select/explain responses are stored.
    pub cacheable: bool,
}

type LoadResult = Result<Arc<ResultPage>, Arc<anyhow::Error>>;

struct Entry {
    value: Arc<ResultPage>,
    bytes: u64,
    inserted: Instant,
    ttl: Duration,
    bucket: (String, String),
    tables: Vec<String>,
}

impl Entry {
    fn fresh(&self) -> bool {
        self.inserted.elapsed() <= self.ttl
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    bytes: u64,
    pending: HashMap<String, broadcast::Sender<LoadResult>>,
    /// Bumped per bucket on invalidation; an in-flight load started against
    /// an older generation must not store its result.
    generations: HashMap<(String, String), u64>,
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: u64,
}

/// Clears the pending slot if the loading request is dropped mid-flight, so
/// waiters fail fast instead of hanging.
struct PendingGuard<'a> {
    cache: &'a ResponseCache,
    fingerprint: String,
    done: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let sender = self.cache.inner.lock().pending.remove(&self.fingerprint);
        if let Some(sender) = sender {
            let _ = sender.send(Err(Arc::new(ErrorMetadata::canceled().into())));
        }
    }
}

/// Errors can't be cloned across waiters; carry the classification over and
/// flatten the rest into text.
fn reclassify(e: &anyhow::Error) -> anyhow::Error {
    match e.metadata() {
        Some(em) => em.clone().into(),
        None => anyhow::anyhow!("{e:#}"),
    }
}

impl ResponseCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                pending: HashMap::new(),
                generations: HashMap::new(),
            }),
            max_entries: *CACHE_MAX_ENTRIES,
            max_bytes: *CACHE_MAX_BYTES,
        })
    }

    #[cfg(test)]
    fn with_limits(max_entries: usize, max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                pending: HashMap::new(),
                generations: HashMap::new(),
            }),
            max_entries,
            max_bytes,
        })
    }

    /// Read-through with single-flight: a hit returns immediately, a miss
    /// runs `loader` while concurrent identical requests wait for its
    /// result. `use_cache = false` skips the read and the wait but still
    /// stores.
    pub async fn get_or_load<F>(
        &self,
        request: CacheRequest,
        loader: F,
    ) -> anyhow::Result<Arc<ResultPage>>
    where
        F: std::future::Future<Output = anyhow::Result<ResultPage>>,
    {
        let bucket = (request.connection.clone(), request.database.clone());
        let generation;
        if request.use_cache && request.cacheable {
            let mut waiter = None;
            {
                let mut inner = self.inner.lock();
                generation = inner.generation(&bucket);
                let fresh_hit = match inner.entries.get(&request.fingerprint) {
                    Some(entry) if entry.fresh() => Some(entry.value.clone()),
                    _ => None,
                };
                if let Some(value) = fresh_hit {
                    return Ok(value);
                }
                // Anything still present under this fingerprint is expired.
                if let Some(entry) = inner.entries.pop(&request.fingerprint) {
                    inner.bytes -= entry.bytes;
                }
                if let Some(sender) = inner.pending.get(&request.fingerprint) {
                    waiter = Some(sender.subscribe());
                } else {
                    let (sender, _) = broadcast::channel(1);
                    inner.pending.insert(request.fingerprint.clone(), sender);
                }
            }
            if let Some(mut rx) = waiter {
                return match rx.recv().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(reclassify(&e)),
                    Err(_) => Err(ErrorMetadata::canceled().into()),
                };
            }
        } else {
            generation = self.inner.lock().generation(&bucket);
        }

        let guard = PendingGuard {
            cache: self,
            fingerprint: request.fingerprint.clone(),
            done: !(request.use_cache && request.cacheable),
        };
        let result = loader.await;
        self.finish(request, bucket, generation, guard, result)
    }

    fn finish(
        &self,
        request: CacheRequest,
        bucket: (String, String),
        generation: u64,
        mut guard: PendingGuard<'_>,
        result: anyhow::Result<ResultPage>,
    ) -> anyhow::Result<Arc<ResultPage>> {
        let had_pending = !guard.done;
        guard.done = true;

        let shared = result.map(Arc::new).map_err(Arc::new);
        let mut inner = self.inner.lock();
        if had_pending {
            if let Some(sender) = inner.pending.remove(&request.fingerprint) {
                let _ = sender.send(shared.clone());
            }
        }
        if let Ok(value) = &shared {
            let stale = inner.generation(&bucket) != generation;
            if request.cacheable && !stale {
                let bytes = serde_json::to_vec(value.as_ref())
                    .map(|b| b.len() as u64)
                    .unwrap_or(0);
                let ttl = request
                    .ttl_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(*CACHE_TTL_CEILING)
                    .min(*CACHE_TTL_CEILING);
                if let Some(old) = inner.entries.pop(&request.fingerprint) {
                    inner.bytes -= old.bytes;
                }
                inner.bytes += bytes;
                inner.entries.push(
                    request.fingerprint.clone(),
                    Entry {
                        value: value.clone(),
                        bytes,
                        inserted: Instant::now(),
                        ttl,
                        bucket,
                        tables: request.tables,
                    },
                );
                while inner.entries.len() > self.max_entries || inner.bytes > self.max_bytes {
                    match inner.entries.pop_lru() {
                        Some((_, evicted)) => inner.bytes -= evicted.bytes,
                        None => break,
                    }
                }
            }
        }
        match shared {
            Ok(value) => Ok(value),
            Err(e) => Err(reclassify(&e)),
        }
    }

    /// Drops every entry for one (connection, database) and bumps its
    /// generation so racing loads don't resurrect stale results. Called on
    /// `modify-structure`.
    pub fn invalidate_bucket(&self, connection: &str, database: &str) {
        let bucket = (connection.to_string(), database.to_string());
        let mut inner = self.inner.lock();
        *inner.generations.entry(bucket.clone()).or_insert(0) += 1;
        inner.retain(|entry| entry.bucket != bucket);
    }

    /// Drops every entry across all databases of one connection. Called
    /// when the connection's definition changes.
    pub fn invalidate_connection(&self, connection: &str) {
        let mut inner = self.inner.lock();
        let buckets: Vec<(String, String)> = inner
            .generations
            .keys()
            .filter(|(c, _)| c == connection)
            .cloned()
            .collect();
        for bucket in buckets {
            *inner.generations.entry(bucket).or_insert(0) += 1;
        }
        inner.retain(|entry| entry.bucket.0 != connection);
    }

    /// Targeted `modify-data` invalidation: drops entries whose statement
    /// references any of `tables`. An empty list falls back to the coarse
    /// bucket invalidation.
    pub fn invalidate_tables(&self, connection: &str, database: &str, tables: &[String]) {
        if tables.is_empty() {
            return self.invalidate_bucket(connection, database);
        }
        let bucket = (connection.to_string(), database.to_string());
        let mut inner = self.inner.lock();
        *inner.generations.entry(bucket.clone()).or_insert(0) += 1;
        inner.retain(|entry| {
            entry.bucket != bucket || !entry.tables.iter().any(|t| tables.contains(t))
        });
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Inner {
    fn generation(&mut self, bucket: &(String, String)) -> u64 {
        *self.generations.entry(bucket.clone()).or_insert(0)
    }

    fn retain(&mut self, keep: impl Fn(&Entry) -> bool) {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !keep(entry))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in doomed {
            if let Some(entry) = self.entries.pop(&fp) {
                self.bytes -= entry.bytes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use serde_json::json;

    use super::*;
    use crate::results::{
        ResultEntries,
        ResultPage,
    };

    fn page(n: i64) -> ResultPage {
        ResultPage::Select {
            page: 1,
            page_size: 10,
            total_count: n,
            total_pages: 1,
            sort: None,
            entries: ResultEntries::default(),
        }
    }

    fn request(fp: &str) -> CacheRequest {
        CacheRequest {
            connection: "c".to_string(),
            database: "d".to_string(),
            fingerprint: fp.to_string(),
            tables: vec!["users".to_string()],
            ttl_seconds: None,
            use_cache: true,
            cacheable: true,
        }
    }

    #[test]
    fn test_fingerprint_stable_under_key_reordering() {
        // The same logical request arriving with differently-ordered JSON
        // objects deserializes into identical typed values, so the
        // fingerprints collide by construction.
        let a: Sort = serde_json::from_value(json!({ "column_idx": 1, "direction": "ASC" })).unwrap();
        let b: Sort = serde_json::from_value(json!({ "direction": "ASC", "column_idx": 1 })).unwrap();
        let fa = fingerprint("c", "d", "SELECT 1", &[json!(1)], Some(&a), &[], 1, 10);
        let fb = fingerprint("c", "d", "SELECT 1", &[json!(1)], Some(&b), &[], 1, 10);
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_fingerprint_scope() {
        let base = fingerprint("c", "d", "SELECT 1", &[], None, &[], 1, 10);
        assert_ne!(base, fingerprint("c2", "d", "SELECT 1", &[], None, &[], 1, 10));
        assert_ne!(base, fingerprint("c", "d2", "SELECT 1", &[], None, &[], 1, 10));
        assert_ne!(base, fingerprint("c", "d", "SELECT 1", &[], None, &[], 2, 10));
        assert_ne!(base, fingerprint("c", "d", "SELECT 1", &[], None, &[], 1, 25));
        assert_ne!(base, fingerprint("c", "d", "SELECT 2", &[], None, &[], 1, 10));
    }

    #[tokio::test]
    async fn test_hit_skips_loader() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_load(request("fp"), async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(page(1))
                })
                .await?;
            assert_eq!(*value, page(1));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_flight() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = cache.get_or_load(request("fp"), {
            let loads = loads.clone();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                release_rx.await.ok();
                Ok(page(7))
            }
        });
        let follower = cache.get_or_load(request("fp"), {
            let loads = loads.clone();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(page(7))
            }
        });

        let both = async {
            let (a, b) = tokio::join!(leader, follower);
            (a.unwrap(), b.unwrap())
        };
        tokio::pin!(both);
        // Let both tasks reach the cache before releasing the leader.
        tokio::select! {
            biased;
            _ = &mut both => panic!("leader is parked"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {},
        }
        release_tx.send(()).ok();
        let (a, b) = both.await;
        assert_eq!(*a, page(7));
        assert_eq!(*b, page(7));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_expiry() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let mut req = request("fp");
        req.ttl_seconds = Some(0);
        cache.get_or_load(req, async { Ok(page(1)) }).await?;

        let loads = AtomicUsize::new(0);
        cache
            .get_or_load(request("fp"), async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(page(2))
            })
            .await?;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bucket_invalidation() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        cache.get_or_load(request("fp"), async { Ok(page(1)) }).await?;
        cache.invalidate_bucket("c", "d");

        let loads = AtomicUsize::new(0);
        cache
            .get_or_load(request("fp"), async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(page(2))
            })
            .await?;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_other_bucket_untouched() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        cache.get_or_load(request("fp"), async { Ok(page(1)) }).await?;
        cache.invalidate_bucket("c", "other_db");

        let loads = AtomicUsize::new(0);
        cache
            .get_or_load(request("fp"), async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(page(2))
            })
            .await?;
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_table_invalidation_is_targeted() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let mut orders = request("fp_orders");
        orders.tables = vec!["orders".to_string()];
        cache.get_or_load(orders, async { Ok(page(1)) }).await?;
        cache.get_or_load(request("fp_users"), async { Ok(page(2)) }).await?;

        cache.invalidate_tables("c", "d", &["users".to_string()]);
        assert_eq!(cache.entry_count(), 1);

        // No determinable relation: coarse invalidation.
        cache.invalidate_tables("c", "d", &[]);
        assert_eq!(cache.entry_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_racing_load_does_not_resurrect_stale_entry() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let load = cache.get_or_load(request("fp"), async move {
            release_rx.await.ok();
            Ok(page(1))
        });
        tokio::pin!(load);
        tokio::select! {
            biased;
            _ = &mut load => panic!("loader is parked"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {},
        }
        // The bucket is invalidated while the load is in flight; its result
        // must not be stored.
        cache.invalidate_bucket("c", "d");
        release_tx.send(()).ok();
        load.await?;
        assert_eq!(cache.entry_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_use_cache_false_reloads_but_stores() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let mut req = request("fp");
        req.use_cache = false;
        cache.get_or_load(req, async { Ok(page(1)) }).await?;

        let mut req = request("fp");
        req.use_cache = false;
        let loads = AtomicUsize::new(0);
        cache
            .get_or_load(req, async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(page(2))
            })
            .await?;
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // A cached read now sees the refreshed value.
        let value = cache
            .get_or_load(request("fp"), async { Ok(page(3)) })
            .await?;
        assert_eq!(*value, page(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() -> anyhow::Result<()> {
        let cache = ResponseCache::new();
        let err = cache
            .get_or_load(request("fp"), async {
                Err(ErrorMetadata::bad_request("Nope", "nope").into())
            })
            .await
            .unwrap_err();
        assert_eq!(err.short_msg(), "Nope");
        assert_eq!(cache.entry_count(), 0);

        let value = cache.get_or_load(request("fp"), async { Ok(page(1)) }).await?;
        assert_eq!(*value, page(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_lru_eviction_by_count_and_bytes() -> anyhow::Result<()> {
        let cache = ResponseCache::with_limits(2, u64::MAX);
        for i in 0..3 {
            cache
                .get_or_load(request(&format!("fp{i}")), async move { Ok(page(i)) })
                .await?;
        }
        assert_eq!(cache.entry_count(), 2);

        let tiny = ResponseCache::with_limits(10, 1);
        tiny.get_or_load(request("fp"), async { Ok(page(1)) }).await?;
        // A single oversized entry is evicted immediately.
        assert_eq!(tiny.entry_count(), 0);
        Ok(())
    }
}
