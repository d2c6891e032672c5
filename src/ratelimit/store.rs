//! Token store trait and token bucket arithmetic.
//!
//! The engine only talks to a [`TokenStore`]; where buckets live (process
//! memory, a remote cache) is up to the implementation. [`BucketState`]
//! carries the refill rules so every backend accounts identically.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::key::AccountingKey;
use super::policy::BucketSpec;
use crate::error::Result;

/// Result of a single consume attempt against one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether a token was taken
    pub success: bool,
    /// Tokens left in the bucket after the attempt
    pub tokens_remaining: u64,
    /// Time until at least one token is available; set only on failure
    pub retry_after: Option<Duration>,
}

/// Abstract storage for token buckets keyed by [`AccountingKey`].
///
/// Operations on the same key must be linearizable. Implementations backed
/// by a remote service report connectivity failures as
/// [`WardenError::StoreUnavailable`](crate::error::WardenError::StoreUnavailable).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Refill the bucket for elapsed time, then take one token if available.
    ///
    /// A bucket seen for the first time starts full.
    async fn try_consume(
        &self,
        key: &AccountingKey,
        bucket: &BucketSpec,
        now: Instant,
    ) -> Result<ConsumeOutcome>;

    /// Return one token to the bucket, capped at `max_burst`.
    ///
    /// Refunding a key that no longer exists recreates it full. Returns the
    /// tokens remaining after the refund.
    async fn refund(&self, key: &AccountingKey, bucket: &BucketSpec, now: Instant) -> Result<u64>;
}

/// State of one token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whole tokens currently available, `0..=max_burst`
    pub tokens: u64,
    /// Instant up to which refill has been credited
    pub last_refill: Instant,
    /// Last consume or refund
    pub last_access: Instant,
}

impl BucketState {
    /// A full bucket.
    pub fn full(bucket: &BucketSpec, now: Instant) -> Self {
        Self {
            tokens: bucket.max_burst,
            last_refill: now,
            last_access: now,
        }
    }

    /// Credit tokens earned since `last_refill`, capped at `max_burst`.
    ///
    /// Only the time that bought whole tokens is consumed, so partial
    /// progress toward the next token carries over.
    pub fn refill(&mut self, bucket: &BucketSpec, now: Instant) {
        if self.tokens >= bucket.max_burst {
            self.tokens = bucket.max_burst;
            self.last_refill = self.last_refill.max(now);
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let window = bucket.window.as_nanos().max(1);
        let earned = elapsed * u128::from(bucket.refill_per_window) / window;
        if earned == 0 {
            return;
        }

        let room = u128::from(bucket.max_burst - self.tokens);
        if earned >= room {
            self.tokens = bucket.max_burst;
            self.last_refill = now;
        } else {
            // earned < room <= u64::MAX
            let earned = earned as u64;
            self.tokens += earned;
            self.last_refill += bucket.time_for_tokens(earned).min(now - self.last_refill);
        }
    }

    /// Refill, then take one token if possible.
    pub fn try_take(&mut self, bucket: &BucketSpec, now: Instant) -> ConsumeOutcome {
        self.refill(bucket, now);
        self.last_access = now;

        if self.tokens >= 1 {
            self.tokens -= 1;
            ConsumeOutcome {
                success: true,
                tokens_remaining: self.tokens,
                retry_after: None,
            }
        } else {
            ConsumeOutcome {
                success: false,
                tokens_remaining: 0,
                retry_after: Some(self.retry_after(bucket, now)),
            }
        }
    }

    /// Refill, then add one token back, capped at `max_burst`.
    pub fn give_back(&mut self, bucket: &BucketSpec, now: Instant) -> u64 {
        self.refill(bucket, now);
        self.last_access = now;
        self.tokens = (self.tokens + 1).min(bucket.max_burst);
        self.tokens
    }

    /// Time until the next whole token is credited.
    fn retry_after(&self, bucket: &BucketSpec, now: Instant) -> Duration {
        let progress = now.saturating_duration_since(self.last_refill);
        bucket
            .time_for_tokens(1)
            .saturating_sub(progress)
            .max(Duration::from_nanos(1))
    }

    /// Whether the bucket has been idle long enough to be full again, in
    /// which case dropping it loses nothing.
    pub fn is_expired(&self, bucket: &BucketSpec, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) >= bucket.time_to_full()
    }
}
