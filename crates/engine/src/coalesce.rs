//! Request coalescing and the response cache.
//!
//! One map holds both cached results and in-flight markers, guarded by a
//! single mutex so the check-then-claim sequence is atomic: at most one
//! computation can ever be in flight per key. Waiters subscribe to the
//! claim's broadcast channel and receive the identical outcome the claimer
//! produced. The claim is released by a drop guard, so it cannot leak on
//! any exit path — error, panic, or cancellation.
//!
//! The mutex is only ever held for map operations, never across an await.

use std::{collections::HashMap, future::Future, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::broadcast, time::Instant};
use tracing::debug;

use quotapool_types::{NodeId, PrincipalId, Variant};

use crate::error::ResolveError;

/// Coalescing/cache key: one slot per (principal, resource, variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub principal: PrincipalId,
    pub resource_id: String,
    pub variant: Variant,
}

/// A completed resolution, as returned to callers and kept in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub url: String,
    /// Node that served the resolution.
    pub node: NodeId,
    /// Credit charged to the principal.
    pub cost: i64,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    resolved: Resolved,
    expires_at: Instant,
}

enum Slot {
    InFlight(broadcast::Sender<Result<Resolved, ResolveError>>),
    Ready(CachedEntry),
}

enum Action {
    Hit(Resolved),
    Wait(broadcast::Receiver<Result<Resolved, ResolveError>>),
    Claim(broadcast::Sender<Result<Resolved, ResolveError>>),
}

pub struct ResolveCache {
    ttl: Duration,
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl ResolveCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached result for `key`, join an in-flight computation,
    /// or claim the key and drive `compute` to produce the shared outcome.
    ///
    /// On success the result is cached for the configured TTL; on failure
    /// nothing is cached. Either way every caller that arrived while the
    /// computation ran observes the same outcome.
    pub async fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<Resolved, ResolveError>
    where
        F: Future<Output = Result<Resolved, ResolveError>>,
    {
        let action = {
            let mut slots = self.slots.lock();
            let now = Instant::now();
            slots.retain(|_, slot| match slot {
                Slot::Ready(entry) => entry.expires_at > now,
                Slot::InFlight(_) => true,
            });
            match slots.get(&key) {
                Some(Slot::Ready(entry)) => Action::Hit(entry.resolved.clone()),
                Some(Slot::InFlight(sender)) => Action::Wait(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    slots.insert(key.clone(), Slot::InFlight(sender.clone()));
                    Action::Claim(sender)
                }
            }
        };

        match action {
            Action::Hit(resolved) => {
                debug!(principal = %key.principal, resource = %key.resource_id, "cache hit");
                Ok(resolved)
            }
            Action::Wait(mut receiver) => {
                debug!(principal = %key.principal, resource = %key.resource_id, "joining in-flight resolution");
                receiver.recv().await.unwrap_or(Err(ResolveError::Abandoned))
            }
            Action::Claim(sender) => {
                let claim = ClaimGuard {
                    slots: &self.slots,
                    key: key.clone(),
                };
                let outcome = compute.await;
                {
                    let mut slots = self.slots.lock();
                    match &outcome {
                        Ok(resolved) => {
                            slots.insert(
                                key,
                                Slot::Ready(CachedEntry {
                                    resolved: resolved.clone(),
                                    expires_at: Instant::now() + self.ttl,
                                }),
                            );
                        }
                        Err(_) => {
                            slots.remove(&key);
                        }
                    }
                }
                claim.disarm();
                let _ = sender.send(outcome.clone());
                outcome
            }
        }
    }

    /// Drop every cached entry for a resource, across principals and
    /// variants, returning what was cached so the caller can notify the
    /// serving nodes. In-flight computations are left alone.
    pub fn invalidate_resource(&self, resource_id: &str) -> Vec<Resolved> {
        let mut slots = self.slots.lock();
        let keys: Vec<CacheKey> = slots
            .iter()
            .filter(|(key, slot)| key.resource_id == resource_id && matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| match slots.remove(&key) {
                Some(Slot::Ready(entry)) => Some(entry.resolved),
                _ => None,
            })
            .collect()
    }

    /// Number of live slots (cached + in flight).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Removes the in-flight marker when the claimer unwinds without
/// completing, so a panicking or cancelled computation cannot wedge its
/// key forever.
struct ClaimGuard<'a> {
    slots: &'a Mutex<HashMap<CacheKey, Slot>>,
    key: CacheKey,
}

impl ClaimGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(&self.key), Some(Slot::InFlight(_))) {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::Notify;

    fn key(resource: &str) -> CacheKey {
        CacheKey {
            principal: PrincipalId(1),
            resource_id: resource.into(),
            variant: Variant::Archive,
        }
    }

    fn resolved(url: &str) -> Resolved {
        Resolved {
            url: url.into(),
            node: NodeId(3),
            cost: 1_200,
        }
    }

    #[tokio::test]
    async fn computes_once_then_serves_from_cache() {
        let cache = ResolveCache::new(Duration::from_secs(60));
        let computations = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_compute(key("r1"), async {
                    computations.fetch_add(1, Ordering::SeqCst);
                    Ok(resolved("https://dl.example/a"))
                })
                .await
                .expect("resolve");
            assert_eq!(result.url, "https://dl.example/a");
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_the_ttl() {
        let cache = ResolveCache::new(Duration::from_secs(60));
        let computations = AtomicUsize::new(0);

        let compute = |label: &'static str| {
            let counter = &computations;
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(resolved(label))
            }
        };

        cache.get_or_compute(key("r1"), compute("first")).await.expect("resolve");
        tokio::time::advance(Duration::from_secs(59)).await;
        let hit = cache.get_or_compute(key("r1"), compute("second")).await.expect("resolve");
        assert_eq!(hit.url, "first", "entry still live just before the TTL");

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.get_or_compute(key("r1"), compute("third")).await.expect("resolve");
        assert_eq!(fresh.url, "third", "expired entry must recompute");
        assert_eq!(computations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(ResolveCache::new(Duration::from_secs(60)));
        let computations = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        // First caller claims the key and blocks on the gate.
        let leader = {
            let cache = Arc::clone(&cache);
            let computations = Arc::clone(&computations);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("r1"), async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(resolved("shared"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let mut waiters = Vec::new();
        for _ in 0..9 {
            let cache = Arc::clone(&cache);
            let computations = Arc::clone(&computations);
            waiters.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("r1"), async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        Ok(resolved("should never run"))
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;
        gate.notify_one();

        let lead = leader.await.expect("join").expect("resolve");
        for waiter in waiters {
            let outcome = waiter.await.expect("join").expect("resolve");
            assert_eq!(outcome, lead);
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_shared_and_never_cached() {
        let cache = Arc::new(ResolveCache::new(Duration::from_secs(60)));
        let gate = Arc::new(Notify::new());

        let leader = {
            let cache = Arc::clone(&cache);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("r1"), async move {
                        gate.notified().await;
                        Err(ResolveError::DispatchExhausted { attempts: 3 })
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compute(key("r1"), async { Ok(resolved("unused")) }).await })
        };
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(
            leader.await.expect("join"),
            Err(ResolveError::DispatchExhausted { attempts: 3 })
        );
        assert_eq!(
            waiter.await.expect("join"),
            Err(ResolveError::DispatchExhausted { attempts: 3 }),
            "waiters observe the identical failure"
        );
        assert!(cache.is_empty(), "failed outcomes must not populate the cache");
    }

    #[tokio::test]
    async fn cancelled_claims_release_the_key() {
        let cache = Arc::new(ResolveCache::new(Duration::from_secs(60)));

        let hung = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("r1"), async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(resolved("never"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cache.len(), 1, "claim is registered");

        hung.abort();
        let _ = hung.await;
        assert!(cache.is_empty(), "aborted claim must release its key");

        // The key is immediately claimable again.
        let retry = cache.get_or_compute(key("r1"), async { Ok(resolved("retry")) }).await.expect("resolve");
        assert_eq!(retry.url, "retry");
    }

    #[tokio::test]
    async fn invalidation_drops_every_variant_of_the_resource() {
        let cache = ResolveCache::new(Duration::from_secs(60));
        cache.get_or_compute(key("r1"), async { Ok(resolved("a")) }).await.expect("resolve");
        cache
            .get_or_compute(
                CacheKey {
                    variant: Variant::Resample,
                    ..key("r1")
                },
                async { Ok(resolved("b")) },
            )
            .await
            .expect("resolve");
        cache.get_or_compute(key("r2"), async { Ok(resolved("c")) }).await.expect("resolve");

        let dropped = cache.invalidate_resource("r1");
        assert_eq!(dropped.len(), 2);
        assert_eq!(cache.len(), 1, "other resources stay cached");
    }
}
