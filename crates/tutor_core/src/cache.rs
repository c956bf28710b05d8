//! crates/tutor_core/src/cache.rs
//!
//! The generation cache. Explanation and quiz content is generated at most
//! once per cache key: a hit is served without touching the quota ledger, a
//! miss is charged first, generated, written back, and refunded if the
//! generation fails or times out.
//!
//! Requests for the same key within this process are serialised through a
//! per-key gate, so a request arriving while another is generating waits and
//! is then served from the cache instead of being charged a second time.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{CacheEntry, CacheKey, CachedContent, QuotaBucket};
use crate::error::{EngineError, EngineResult};
use crate::ports::{GenerationCacheStore, PortResult};
use crate::quota::QuotaLedger;

/// The charge taken from the ledger before a generation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCharge {
    pub user_id: Uuid,
    pub bucket: QuotaBucket,
    pub amount: u32,
}

impl QuotaCharge {
    pub fn one(user_id: Uuid, key: &CacheKey) -> Self {
        Self {
            user_id,
            bucket: key.bucket(),
            amount: 1,
        }
    }
}

/// A cache entry together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Generated {
    pub entry: CacheEntry,
    pub from_cache: bool,
}

pub struct GenerationCache {
    store: Arc<dyn GenerationCacheStore>,
    ledger: Arc<QuotaLedger>,
    timeout: Duration,
    gates: KeyGates,
}

impl GenerationCache {
    pub fn new(
        store: Arc<dyn GenerationCacheStore>,
        ledger: Arc<QuotaLedger>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            timeout,
            gates: KeyGates::default(),
        }
    }

    /// A plain cache read; never generates and never charges.
    pub async fn get(&self, key: &CacheKey) -> EngineResult<Option<CacheEntry>> {
        Ok(self.store.get_cache_entry(key).await?)
    }

    /// Returns the cached entry for `key`, generating it on a miss.
    ///
    /// On a miss the quota charge is taken before `generator` runs; if the
    /// charge is refused the generator is never invoked. A failed or timed
    /// out generation refunds the charge before the error is returned.
    pub async fn get_or_generate<F, Fut>(
        &self,
        key: CacheKey,
        charge: QuotaCharge,
        generator: F,
    ) -> EngineResult<Generated>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = PortResult<CachedContent>> + Send,
    {
        let gate = self.gates.gate(key);
        let _held = gate.lock().await;

        if let Some(entry) = self.store.get_cache_entry(&key).await? {
            debug!(key = %key, "Generation cache hit");
            return Ok(Generated {
                entry,
                from_cache: true,
            });
        }

        debug!(key = %key, "Generation cache miss");
        self.generate_locked(key, charge, generator).await
    }

    /// Deletes the entry for `key`.
    pub async fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        self.store.delete_cache_entry(key).await?;
        info!(key = %key, "Generation cache entry invalidated");
        Ok(())
    }

    /// Drops the entry for `key` and generates it again, charging the ledger
    /// unconditionally.
    pub async fn regenerate<F, Fut>(
        &self,
        key: CacheKey,
        charge: QuotaCharge,
        generator: F,
    ) -> EngineResult<Generated>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = PortResult<CachedContent>> + Send,
    {
        let gate = self.gates.gate(key);
        let _held = gate.lock().await;

        self.invalidate(&key).await?;
        self.generate_locked(key, charge, generator).await
    }

    async fn generate_locked<F, Fut>(
        &self,
        key: CacheKey,
        charge: QuotaCharge,
        generator: F,
    ) -> EngineResult<Generated>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = PortResult<CachedContent>> + Send,
    {
        self.ledger
            .consume(charge.user_id, charge.bucket, charge.amount)
            .await?;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, generator()).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(EngineError::GenerationFailed(e.to_string())),
            Err(_elapsed) => Err(EngineError::GenerationTimeout(self.timeout)),
        };

        let content = match outcome {
            Ok(content) => content,
            Err(err) => {
                warn!(key = %key, error = %err, "Generation failed, refunding quota");
                self.refund(charge).await;
                return Err(err);
            }
        };
        info!(key = %key, elapsed = ?started.elapsed(), "Generated content");

        let entry = CacheEntry {
            key,
            content,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put_cache_entry(&entry).await {
            // The content was produced and is returned; only the write-back is lost.
            error!(key = %key, error = %e, "Failed to write generation cache entry");
        }

        Ok(Generated {
            entry,
            from_cache: false,
        })
    }

    async fn refund(&self, charge: QuotaCharge) {
        if let Err(e) = self
            .ledger
            .refund(charge.user_id, charge.bucket, charge.amount)
            .await
        {
            error!(
                user_id = %charge.user_id,
                bucket = %charge.bucket,
                error = %e,
                "Failed to refund quota after a failed generation"
            );
        }
    }
}

/// In-flight gates, one per cache key currently being requested.
#[derive(Default)]
struct KeyGates {
    gates: Mutex<HashMap<CacheKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyGates {
    fn gate(&self, key: CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.retain(|_, gate| gate.strong_count() > 0);

        if let Some(gate) = gates.get(&key).and_then(Weak::upgrade) {
            return gate;
        }
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        gates.insert(key, Arc::downgrade(&gate));
        gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::ports::PortError;
    use crate::quota::QuotaLimits;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        cache: Arc<GenerationCache>,
        ledger: Arc<QuotaLedger>,
        calls: Arc<AtomicUsize>,
        user_id: Uuid,
    }

    fn fixture(limit: u32, timeout: Duration) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(QuotaLedger::new(
            store.clone(),
            QuotaLimits {
                explanation: limit,
                quiz: limit,
            },
        ));
        Fixture {
            cache: Arc::new(GenerationCache::new(store, ledger.clone(), timeout)),
            ledger,
            calls: Arc::new(AtomicUsize::new(0)),
            user_id: Uuid::new_v4(),
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        text: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<PortResult<CachedContent>> + Send {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(CachedContent::Explanation(text.to_string())))
        }
    }

    async fn used(f: &Fixture) -> u32 {
        f.ledger
            .check(f.user_id, QuotaBucket::Explanation)
            .await
            .unwrap()
            .used
    }

    #[tokio::test]
    async fn repeated_requests_generate_and_charge_once() {
        let f = fixture(10, Duration::from_secs(5));
        let key = CacheKey::Explanation(Uuid::new_v4());

        for round in 0..4 {
            let generated = f
                .cache
                .get_or_generate(key, QuotaCharge::one(f.user_id, &key), counting(&f.calls, "text"))
                .await
                .unwrap();
            assert_eq!(generated.from_cache, round > 0);
            assert_eq!(
                generated.entry.content,
                CachedContent::Explanation("text".to_string())
            );
        }

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(used(&f).await, 1);
    }

    #[tokio::test]
    async fn refused_charge_never_invokes_generator() {
        let f = fixture(0, Duration::from_secs(5));
        let key = CacheKey::Explanation(Uuid::new_v4());

        let err = f
            .cache
            .get_or_generate(key, QuotaCharge::one(f.user_id, &key), counting(&f.calls, "text"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::QuotaExceeded { .. }));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_generation_is_refunded_and_not_cached() {
        let f = fixture(10, Duration::from_secs(5));
        let key = CacheKey::Explanation(Uuid::new_v4());

        let err = f
            .cache
            .get_or_generate(key, QuotaCharge::one(f.user_id, &key), || async {
                Err(PortError::Unexpected("model unavailable".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::GenerationFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(used(&f).await, 0);
        assert!(f.cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_generation_times_out_and_is_refunded() {
        let f = fixture(10, Duration::from_millis(50));
        let key = CacheKey::Explanation(Uuid::new_v4());

        let err = f
            .cache
            .get_or_generate(key, QuotaCharge::one(f.user_id, &key), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(CachedContent::Explanation("late".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::GenerationTimeout(_)));
        assert_eq!(used(&f).await, 0);
    }

    #[tokio::test]
    async fn regenerate_charges_again_and_replaces_content() {
        let f = fixture(10, Duration::from_secs(5));
        let key = CacheKey::Explanation(Uuid::new_v4());

        f.cache
            .get_or_generate(key, QuotaCharge::one(f.user_id, &key), counting(&f.calls, "first"))
            .await
            .unwrap();
        let again = f
            .cache
            .regenerate(key, QuotaCharge::one(f.user_id, &key), counting(&f.calls, "second"))
            .await
            .unwrap();

        assert!(!again.from_cache);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(used(&f).await, 2);
        let stored = f.cache.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.content, CachedContent::Explanation("second".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_generation() {
        let f = fixture(10, Duration::from_secs(5));
        let key = CacheKey::Quiz(Uuid::new_v4());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let cache = f.cache.clone();
                let calls = f.calls.clone();
                let user_id = f.user_id;
                tokio::spawn(async move {
                    cache
                        .get_or_generate(key, QuotaCharge::one(user_id, &key), move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(CachedContent::Explanation("shared".to_string()))
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        let status = f.ledger.check(f.user_id, QuotaBucket::Quiz).await.unwrap();
        assert_eq!(status.used, 1);
    }
}
