//! Rate limit engine: resolves policies, derives keys and charges tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::{build_key, AccountingKey};
use super::policy::RatePolicy;
use super::resolver::PolicySet;
use super::store::TokenStore;
use crate::error::Result;

/// Outcome of charging one policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitingResult {
    /// Whether the policy admitted the request
    pub allowed: bool,
    /// The policy this result was computed for
    pub policy: RatePolicy,
    /// Set to the policy when it denied the request
    pub violated_policy: Option<RatePolicy>,
    /// Tokens left in the bucket after this evaluation
    pub tokens_remaining: u64,
    /// Key of the charged bucket, needed for revert
    pub accounting_key: AccountingKey,
    /// Time until a token is available, set when denied
    pub retry_after: Option<Duration>,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// No policy governs the target.
    NotApplicable,
    /// Every policy admitted the request; one result per charged policy.
    Allowed(Vec<RateLimitingResult>),
    /// The first policy in declared order that ran out of tokens.
    Denied(RateLimitingResult),
}

impl EvaluationOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EvaluationOutcome::Allowed(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, EvaluationOutcome::Denied(_))
    }
}

/// The admission-control engine.
///
/// The engine holds no mutable state of its own; all counters live in the
/// [`TokenStore`], so one engine can be shared across tasks behind an `Arc`.
pub struct RateLimitEngine<S: TokenStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: TokenStore> RateLimitEngine<S> {
    /// Create an engine over `store` using the system clock.
    pub fn new(store: S) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create an engine over a store that is shared with other owners.
    pub fn with_store(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used by [`evaluate`](Self::evaluate) and [`revert`](Self::revert).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Evaluate one unit of work at the current clock time.
    pub async fn evaluate(
        &self,
        policies: &PolicySet,
        client_identity: &str,
        target_identity: &str,
    ) -> Result<EvaluationOutcome> {
        self.evaluate_at(policies, client_identity, target_identity, self.clock.now())
            .await
    }

    /// Evaluate one unit of work at `now`.
    ///
    /// Policies are charged in declared order and evaluation stops at the
    /// first one without tokens. Tokens already taken for earlier policies
    /// are refunded before `Denied` is returned, so a denied request costs
    /// nothing. Identities are validated before any bucket is touched.
    pub async fn evaluate_at(
        &self,
        policies: &PolicySet,
        client_identity: &str,
        target_identity: &str,
        now: Instant,
    ) -> Result<EvaluationOutcome> {
        let effective = dedup(policies.resolve());
        if effective.is_empty() {
            trace!(target_identity = %target_identity, "No policy applies");
            return Ok(EvaluationOutcome::NotApplicable);
        }

        let keys = effective
            .iter()
            .map(|policy| build_key(policy, client_identity, target_identity))
            .collect::<Result<Vec<_>>>()?;

        let mut charged: Vec<RateLimitingResult> = Vec::with_capacity(effective.len());

        for (policy, key) in effective.into_iter().zip(keys) {
            trace!(key = %key, policy = %policy, "Checking rate limit");

            let outcome = match self.store.try_consume(&key, &policy.bucket(), now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(key = %key, error = %err, "Token store failed during evaluation");
                    if let Err(refund_err) = self.refund_all(&charged, now).await {
                        warn!(error = %refund_err, "Could not refund tokens after store failure");
                    }
                    return Err(err);
                }
            };

            if !outcome.success {
                debug!(
                    key = %key,
                    policy = %policy,
                    retry_after = ?outcome.retry_after,
                    refunded = charged.len(),
                    "Rate limit exceeded"
                );
                self.refund_all(&charged, now).await?;

                return Ok(EvaluationOutcome::Denied(RateLimitingResult {
                    allowed: false,
                    policy,
                    violated_policy: Some(policy),
                    tokens_remaining: outcome.tokens_remaining,
                    accounting_key: key,
                    retry_after: outcome.retry_after,
                }));
            }

            charged.push(RateLimitingResult {
                allowed: true,
                policy,
                violated_policy: None,
                tokens_remaining: outcome.tokens_remaining,
                accounting_key: key,
                retry_after: None,
            });
        }

        Ok(EvaluationOutcome::Allowed(charged))
    }

    /// Give back the token charged for `result` at the current clock time.
    ///
    /// Call at most once per charged result; every extra call credits the
    /// bucket again. Returns the tokens remaining after the refund.
    ///
    /// A denied result charged nothing, so the store is left untouched and
    /// the result's own remaining count is returned.
    pub async fn revert(&self, result: &RateLimitingResult) -> Result<u64> {
        if !result.allowed {
            debug!(key = %result.accounting_key, "Denied result charged nothing, skipping revert");
            return Ok(result.tokens_remaining);
        }
        self.revert_at(&result.accounting_key, &result.policy, self.clock.now())
            .await
    }

    /// Give back one token to the bucket `key` accounted under `policy`.
    pub async fn revert_at(
        &self,
        key: &AccountingKey,
        policy: &RatePolicy,
        now: Instant,
    ) -> Result<u64> {
        let remaining = self.store.refund(key, &policy.bucket(), now).await?;
        debug!(key = %key, remaining = remaining, "Reverted token");
        Ok(remaining)
    }

    /// Give back every token charged by an `Allowed` outcome.
    ///
    /// `Denied` and `NotApplicable` outcomes charged nothing and are ignored.
    pub async fn revert_outcome(&self, outcome: &EvaluationOutcome) -> Result<()> {
        match outcome {
            EvaluationOutcome::Allowed(results) => self.refund_all(results, self.clock.now()).await,
            EvaluationOutcome::Denied(_) | EvaluationOutcome::NotApplicable => Ok(()),
        }
    }

    /// Refund one token per result, returning the first store error after
    /// attempting all of them.
    async fn refund_all(&self, results: &[RateLimitingResult], now: Instant) -> Result<()> {
        let mut first_err = None;
        for result in results {
            if let Err(err) = self.revert_at(&result.accounting_key, &result.policy, now).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Equal policies share one accounting key; charge only the first.
fn dedup(policies: &[RatePolicy]) -> Vec<RatePolicy> {
    let mut unique: Vec<RatePolicy> = Vec::with_capacity(policies.len());
    for policy in policies {
        match unique.iter().find(|kept| *kept == policy) {
            Some(kept) => {
                if kept.max_burst() != policy.max_burst() {
                    warn!(
                        policy = %policy,
                        kept_burst = kept.max_burst(),
                        dropped_burst = policy.max_burst(),
                        "Duplicate policy with a different burst ignored"
                    );
                }
            }
            None => unique.push(*policy),
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::InMemoryTokenStore;
    use crate::ratelimit::policy::{BucketSpec, RateUnit};
    use crate::ratelimit::store::ConsumeOutcome;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    fn policy(limit: u64, unit: RateUnit) -> RatePolicy {
        RatePolicy::new(limit, unit).unwrap()
    }

    fn engine() -> (RateLimitEngine<InMemoryTokenStore>, ManualClock) {
        let clock = ManualClock::default();
        let engine =
            RateLimitEngine::new(InMemoryTokenStore::new()).with_clock(Arc::new(clock.clone()));
        (engine, clock)
    }

    /// Delegates to an in-memory store until `fail_after` consumes have
    /// happened. Refunds always fail when `fail_refunds` is set.
    struct FlakyStore {
        inner: InMemoryTokenStore,
        fail_after: usize,
        fail_refunds: bool,
        consumes: parking_lot::Mutex<usize>,
    }

    impl FlakyStore {
        fn new(fail_after: usize, fail_refunds: bool) -> Self {
            Self {
                inner: InMemoryTokenStore::new(),
                fail_after,
                fail_refunds,
                consumes: parking_lot::Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenStore for FlakyStore {
        async fn try_consume(
            &self,
            key: &AccountingKey,
            bucket: &BucketSpec,
            now: Instant,
        ) -> Result<ConsumeOutcome> {
            {
                let mut consumes = self.consumes.lock();
                if *consumes >= self.fail_after {
                    return Err(WardenError::StoreUnavailable("connection refused".into()));
                }
                *consumes += 1;
            }
            self.inner.try_consume(key, bucket, now).await
        }

        async fn refund(
            &self,
            key: &AccountingKey,
            bucket: &BucketSpec,
            now: Instant,
        ) -> Result<u64> {
            if self.fail_refunds {
                return Err(WardenError::StoreUnavailable("connection reset".into()));
            }
            self.inner.refund(key, bucket, now).await
        }
    }

    #[tokio::test]
    async fn test_empty_policy_set_is_not_applicable() {
        let (engine, _) = engine();
        let outcome = engine
            .evaluate(&PolicySet::default(), "client", "GET /")
            .await
            .unwrap();
        assert_eq!(outcome, EvaluationOutcome::NotApplicable);
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_reports_every_policy() {
        let (engine, _) = engine();
        let set = PolicySet::new(
            vec![policy(10, RateUnit::Second), policy(100, RateUnit::Minute)],
            Vec::new(),
        );

        let outcome = engine.evaluate(&set, "client", "GET /").await.unwrap();
        match outcome {
            EvaluationOutcome::Allowed(results) => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].tokens_remaining, 9);
                assert_eq!(results[1].tokens_remaining, 99);
                assert!(results.iter().all(|r| r.allowed && r.violated_policy.is_none()));
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denied_refunds_earlier_policies() {
        let (engine, clock) = engine();
        let loose = policy(10, RateUnit::Minute);
        let tight = policy(1, RateUnit::Minute);
        let set = PolicySet::new(vec![loose, tight], Vec::new());

        assert!(engine.evaluate(&set, "c", "t").await.unwrap().is_allowed());

        let loose_key = build_key(&loose, "c", "t").unwrap();
        let before = engine.store().tokens(&loose_key, clock.now());
        assert_eq!(before, Some(9));

        let outcome = engine.evaluate(&set, "c", "t").await.unwrap();
        match outcome {
            EvaluationOutcome::Denied(result) => {
                assert_eq!(result.violated_policy, Some(tight));
                assert_eq!(result.retry_after, Some(Duration::from_secs(60)));
            }
            other => panic!("expected Denied, got {:?}", other),
        }
        assert_eq!(engine.store().tokens(&loose_key, clock.now()), before);
    }

    #[tokio::test]
    async fn test_first_violation_in_declared_order_wins() {
        let (engine, _) = engine();
        let first = policy(1, RateUnit::Hour);
        let second = policy(1, RateUnit::Day);
        let set = PolicySet::new(vec![first, second], Vec::new());

        engine.evaluate(&set, "c", "t").await.unwrap();
        match engine.evaluate(&set, "c", "t").await.unwrap() {
            EvaluationOutcome::Denied(result) => assert_eq!(result.violated_policy, Some(first)),
            other => panic!("expected Denied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_policies_charged_once() {
        let (engine, _) = engine();
        let per_minute = policy(5, RateUnit::Minute);
        let same_window = RatePolicy::per_period(5, Duration::from_secs(60)).unwrap();
        let set = PolicySet::new(vec![per_minute, same_window], Vec::new());

        match engine.evaluate(&set, "c", "t").await.unwrap() {
            EvaluationOutcome::Allowed(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].tokens_remaining, 4);
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_identity_touches_nothing() {
        let (engine, _) = engine();
        let set = PolicySet::new(vec![policy(1, RateUnit::Second)], Vec::new());

        let err = assert_err!(engine.evaluate(&set, "", "GET /").await);
        assert!(matches!(err, WardenError::InvalidIdentity(_)));
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_revert_restores_token() {
        let (engine, clock) = engine();
        let set = PolicySet::new(vec![policy(3, RateUnit::Minute)], Vec::new());

        let outcome = engine.evaluate(&set, "c", "t").await.unwrap();
        let EvaluationOutcome::Allowed(results) = outcome else {
            panic!("expected Allowed");
        };
        assert_eq!(results[0].tokens_remaining, 2);

        let remaining = assert_ok!(engine.revert(&results[0]).await);
        assert_eq!(remaining, 3);
        assert_eq!(
            engine.store().tokens(&results[0].accounting_key, clock.now()),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_revert_outcome_ignores_denied() {
        let (engine, clock) = engine();
        let p = policy(1, RateUnit::Minute);
        let set = PolicySet::new(vec![p], Vec::new());

        engine.evaluate(&set, "c", "t").await.unwrap();
        let denied = engine.evaluate(&set, "c", "t").await.unwrap();
        assert!(denied.is_denied());

        assert_ok!(engine.revert_outcome(&denied).await);
        let key = build_key(&p, "c", "t").unwrap();
        assert_eq!(engine.store().tokens(&key, clock.now()), Some(0));
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced_and_refunded() {
        let clock = ManualClock::default();
        let engine =
            RateLimitEngine::new(FlakyStore::new(1, false)).with_clock(Arc::new(clock.clone()));
        let first = policy(5, RateUnit::Minute);
        let set = PolicySet::new(vec![first, policy(5, RateUnit::Hour)], Vec::new());

        let err = assert_err!(engine.evaluate(&set, "c", "t").await);
        assert!(matches!(err, WardenError::StoreUnavailable(_)));

        let key = build_key(&first, "c", "t").unwrap();
        assert_eq!(engine.store().inner.tokens(&key, clock.now()), Some(5));
    }

    #[tokio::test]
    async fn test_revert_of_denied_result_grants_nothing() {
        let (engine, clock) = engine();
        let p = policy(1, RateUnit::Hour);
        let set = PolicySet::new(vec![p], Vec::new());

        engine.evaluate(&set, "c", "t").await.unwrap();
        let EvaluationOutcome::Denied(denied) = engine.evaluate(&set, "c", "t").await.unwrap()
        else {
            panic!("expected Denied");
        };

        assert_eq!(assert_ok!(engine.revert(&denied).await), 0);
        assert_eq!(
            engine.store().tokens(&denied.accounting_key, clock.now()),
            Some(0)
        );
        assert!(engine.evaluate(&set, "c", "t").await.unwrap().is_denied());
    }

    #[tokio::test]
    async fn test_refund_failure_on_denial_is_surfaced() {
        let clock = ManualClock::default();
        let engine = RateLimitEngine::new(FlakyStore::new(usize::MAX, true))
            .with_clock(Arc::new(clock.clone()));
        let loose = policy(10, RateUnit::Minute);
        let tight = policy(1, RateUnit::Minute);
        let set = PolicySet::new(vec![loose, tight], Vec::new());

        assert!(engine.evaluate(&set, "c", "t").await.unwrap().is_allowed());

        let err = assert_err!(engine.evaluate(&set, "c", "t").await);
        assert!(matches!(err, WardenError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_duplicate_with_other_burst_keeps_first() {
        let (engine, _) = engine();
        let first = policy(5, RateUnit::Minute);
        let bursty = policy(5, RateUnit::Minute).with_max_burst(50).unwrap();
        let set = PolicySet::new(vec![first, bursty], Vec::new());

        let EvaluationOutcome::Allowed(results) = engine.evaluate(&set, "c", "t").await.unwrap()
        else {
            panic!("expected Allowed");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].policy.max_burst(), 5);
        assert_eq!(results[0].tokens_remaining, 4);
    }
}
