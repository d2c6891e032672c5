//! In-memory token store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::Clock;
use super::key::AccountingKey;
use super::policy::BucketSpec;
use super::store::{BucketState, ConsumeOutcome, TokenStore};
use crate::config::StoreConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    spec: BucketSpec,
}

/// Token store holding every bucket in process memory.
///
/// Buckets live in a sharded `DashMap`, so operations on one key only lock
/// that key's shard and never touch a second key while holding it.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    buckets: DashMap<AccountingKey, StoredBucket>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens the bucket for `key` would hold at `now`, without mutating it.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &AccountingKey, now: Instant) -> Option<u64> {
        self.buckets.get(key).map(|stored| {
            let mut state = stored.state;
            state.refill(&stored.spec, now);
            state.tokens
        })
    }

    /// Drop buckets that have been idle long enough to be full again.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, stored| !stored.state.is_expired(&stored.spec, now));
        let evicted = before.saturating_sub(self.buckets.len());

        trace!(evicted = evicted, remaining = self.buckets.len(), "Eviction sweep");
        evicted
    }

    /// Spawn a Tokio task that runs [`evict_expired`](Self::evict_expired)
    /// every [`StoreConfig::eviction_interval`].
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped. Abort the returned handle to stop it earlier.
    pub fn spawn_eviction_task(
        self: &Arc<Self>,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let interval = config.eviction_interval();
        debug!(interval = ?interval, "Starting eviction task");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.evict_expired(clock.now());
                    }
                    None => {
                        debug!("Token store dropped, stopping eviction task");
                        break;
                    }
                }
            }
        })
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn try_consume(
        &self,
        key: &AccountingKey,
        bucket: &BucketSpec,
        now: Instant,
    ) -> Result<ConsumeOutcome> {
        let mut stored = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                max_burst = bucket.max_burst,
                window = ?bucket.window,
                "Creating new token bucket"
            );
            StoredBucket {
                state: BucketState::full(bucket, now),
                spec: *bucket,
            }
        });

        stored.spec = *bucket;
        Ok(stored.state.try_take(bucket, now))
    }

    async fn refund(&self, key: &AccountingKey, bucket: &BucketSpec, now: Instant) -> Result<u64> {
        let mut stored = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Refund on missing bucket, recreating it full");
            StoredBucket {
                state: BucketState::full(bucket, now),
                spec: *bucket,
            }
        });

        stored.spec = *bucket;
        Ok(stored.state.give_back(bucket, now))
    }
}
