//! Host-side admission flow.
//!
//! A host pipeline calls [`Admission::begin`] before running a unit of work
//! and threads the returned context to its post-processing stage, where
//! [`Admission::complete`] either keeps the charge or gives the tokens back.
//!
//! Policies normally come from the [`TargetRegistry`]. A host that needs to
//! pick them per request, e.g. per-client quotas, passes a [`PolicySource`]
//! to [`Admission::begin_with`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::ratelimit::{
    EvaluationOutcome, PolicySet, RateLimitEngine, RenderableResult, TargetRegistry, TokenStore,
};

/// What post-processing decided about a unit of work that was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostActionDecision {
    /// The work counts against the quota.
    Keep,
    /// The work should not count; return its tokens.
    Revert,
}

/// The parts of an inbound request the engine needs.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Route template, e.g. `api/orders/{id}`
    pub route: String,
    /// Authenticated principal, if any
    pub authenticated_identity: Option<String>,
    /// Remote address, used when nobody is authenticated
    pub remote_addr: Option<String>,
    headers: HashMap<String, Vec<String>>,
}

impl RequestDescriptor {
    pub fn new(method: &str, route: &str) -> Self {
        Self {
            method: method.to_string(),
            route: route.to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.authenticated_identity = Some(identity.to_string());
        self
    }

    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    /// All values of a header, matched case-insensitively.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `METHOD route`, or empty when the route is unknown.
    pub fn target_identity(&self) -> String {
        if self.route.is_empty() {
            String::new()
        } else {
            format!("{} {}", self.method.to_ascii_uppercase(), self.route)
        }
    }

    /// The authenticated identity, falling back to the remote address.
    pub fn client_identity(&self) -> &str {
        self.authenticated_identity
            .as_deref()
            .filter(|id| !id.is_empty())
            .or(self.remote_addr.as_deref())
            .unwrap_or("")
    }
}

/// Host hook that supplies the policies for a request at run time.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Policies that replace the declared ones for `request`, or `None` to
    /// use the registry.
    async fn policies(&self, request: &RequestDescriptor) -> Result<Option<PolicySet>>;
}

/// Evaluation context carried from pre-processing to post-processing.
pub struct Admission<S: TokenStore> {
    engine: Arc<RateLimitEngine<S>>,
    outcome: EvaluationOutcome,
    response: RenderableResult,
}

impl<S: TokenStore> std::fmt::Debug for Admission<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("outcome", &self.outcome)
            .field("response", &self.response)
            .finish()
    }
}

impl<S: TokenStore> Admission<S> {
    /// Look up the request's policies, evaluate them and render the result.
    #[instrument(
        skip(engine, registry, request),
        fields(method = %request.method, route = %request.route)
    )]
    pub async fn begin(
        engine: Arc<RateLimitEngine<S>>,
        registry: &TargetRegistry,
        request: &RequestDescriptor,
    ) -> Result<Self> {
        let target = request.target_identity();
        let policies = registry.policy_set(&target);
        Self::admit(engine, &policies, &target, request).await
    }

    /// Like [`begin`](Self::begin), but `source` is asked first. Its policies
    /// replace the registry's; `None` falls back to the registry.
    #[instrument(
        skip(engine, registry, source, request),
        fields(method = %request.method, route = %request.route)
    )]
    pub async fn begin_with<P: PolicySource + ?Sized>(
        engine: Arc<RateLimitEngine<S>>,
        registry: &TargetRegistry,
        source: &P,
        request: &RequestDescriptor,
    ) -> Result<Self> {
        let target = request.target_identity();
        let policies = match source.policies(request).await? {
            Some(policies) => {
                debug!(target_identity = %target, "Using host supplied policies");
                policies
            }
            None => registry.policy_set(&target),
        };
        Self::admit(engine, &policies, &target, request).await
    }

    async fn admit(
        engine: Arc<RateLimitEngine<S>>,
        policies: &PolicySet,
        target: &str,
        request: &RequestDescriptor,
    ) -> Result<Self> {
        let outcome = engine
            .evaluate(policies, request.client_identity(), target)
            .await?;
        let response = RenderableResult::from_outcome(&outcome);

        debug!(
            target_identity = %target,
            allowed = outcome.is_allowed(),
            denied = outcome.is_denied(),
            "Admission evaluated"
        );

        Ok(Self {
            engine,
            outcome,
            response,
        })
    }

    pub fn outcome(&self) -> &EvaluationOutcome {
        &self.outcome
    }

    /// Status, headers and message for the host's response.
    pub fn response(&self) -> &RenderableResult {
        &self.response
    }

    pub fn is_throttled(&self) -> bool {
        self.response.is_throttled()
    }

    /// Finish the unit of work.
    ///
    /// `Revert` gives back every token the evaluation charged. The context
    /// is consumed, so a charge can be reverted at most once.
    pub async fn complete(self, decision: PostActionDecision) -> Result<EvaluationOutcome> {
        if decision == PostActionDecision::Revert {
            self.engine.revert_outcome(&self.outcome).await?;
        }
        Ok(self.outcome)
    }
}
