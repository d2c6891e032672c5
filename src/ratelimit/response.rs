//! Rendering evaluation outcomes into response parameters.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::engine::{EvaluationOutcome, RateLimitingResult};

/// Header carrying the policy limit, e.g. `2 tokens per 60 seconds`.
pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
/// Header carrying the tokens left after this request.
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
/// Header carrying the whole seconds to wait before retrying.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";
/// Status used for throttled requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// What the host should add to its response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderableResult {
    /// Status to respond with; `None` lets the request pass through
    pub status: Option<u16>,
    /// Headers to set; several policies produce comma-separated values
    pub headers: BTreeMap<String, String>,
    /// Message naming the violated policy
    pub message: Option<String>,
}

impl RenderableResult {
    /// Render an outcome.
    pub fn from_outcome(outcome: &EvaluationOutcome) -> Self {
        match outcome {
            EvaluationOutcome::NotApplicable => Self::default(),
            EvaluationOutcome::Allowed(results) => Self {
                status: None,
                headers: rate_headers(results),
                message: None,
            },
            EvaluationOutcome::Denied(result) => {
                let mut headers = rate_headers(std::slice::from_ref(result));
                let retry_after = result.retry_after.unwrap_or_default();
                headers.insert(
                    RETRY_AFTER_HEADER.to_string(),
                    retry_after_secs(retry_after).to_string(),
                );

                let violated = result.violated_policy.unwrap_or(result.policy);
                Self {
                    status: Some(TOO_MANY_REQUESTS),
                    headers,
                    message: Some(format!(
                        "Rate limit exceeded: maximum admitted is {}",
                        violated
                    )),
                }
            }
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.status == Some(TOO_MANY_REQUESTS)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// JSON body for throttled responses.
    pub fn body(&self) -> Option<serde_json::Value> {
        let message = self.message.as_ref()?;
        Some(serde_json::json!({
            "status": self.status,
            "message": message,
            "retry_after_secs": self
                .header(RETRY_AFTER_HEADER)
                .and_then(|v| v.parse::<u64>().ok()),
        }))
    }
}

impl From<&EvaluationOutcome> for RenderableResult {
    fn from(outcome: &EvaluationOutcome) -> Self {
        Self::from_outcome(outcome)
    }
}

fn rate_headers(results: &[RateLimitingResult]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        LIMIT_HEADER.to_string(),
        joined(results, |r| r.policy.to_string()),
    );
    headers.insert(
        REMAINING_HEADER.to_string(),
        joined(results, |r| r.tokens_remaining.to_string()),
    );
    headers
}

fn joined<F>(results: &[RateLimitingResult], render: F) -> String
where
    F: Fn(&RateLimitingResult) -> String,
{
    results.iter().map(render).collect::<Vec<_>>().join(", ")
}

/// Whole seconds, rounded up and never zero.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
