//! Accounting key generation.

use std::fmt;

use super::policy::RatePolicy;
use crate::error::{Result, WardenError};

/// A key that uniquely identifies one token counter: one client against one
/// policy on one target.
///
/// The policy component is its signature (window length and limit), not the
/// policy instance, so equal policies declared in different places share a
/// counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountingKey {
    /// Target identity, e.g. `GET api/orders/{id}`
    pub target: String,
    /// Effective window length in nanoseconds
    pub window_nanos: u128,
    /// Policy limit
    pub limit: u64,
    /// Client identity
    pub client: String,
}

impl AccountingKey {
    /// Build the key for `policy` applied to `client_identity` on `target_identity`.
    ///
    /// Fails with [`WardenError::InvalidIdentity`] when either identity is empty.
    pub fn new(policy: &RatePolicy, client_identity: &str, target_identity: &str) -> Result<Self> {
        if client_identity.is_empty() {
            return Err(WardenError::InvalidIdentity(
                "client identity is required".to_string(),
            ));
        }
        if target_identity.is_empty() {
            return Err(WardenError::InvalidIdentity(
                "target identity is required".to_string(),
            ));
        }

        Ok(Self {
            target: target_identity.to_string(),
            window_nanos: policy.window().as_nanos(),
            limit: policy.limit(),
            client: client_identity.to_string(),
        })
    }

    /// Convert the key to a delimited string, for string-keyed backends and logs.
    ///
    /// Format: `{target}|{window_nanos}|{limit}|{client}` with `\` and `|`
    /// escaped inside the identity components.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            escape(&self.target),
            self.window_nanos,
            self.limit,
            escape(&self.client)
        )
    }
}

/// Shorthand for [`AccountingKey::new`].
pub fn build_key(
    policy: &RatePolicy,
    client_identity: &str,
    target_identity: &str,
) -> Result<AccountingKey> {
    AccountingKey::new(policy, client_identity, target_identity)
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        if c == '|' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for AccountingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::RateUnit;
    use std::time::Duration;

    fn per_minute(limit: u64) -> RatePolicy {
        RatePolicy::new(limit, RateUnit::Minute).unwrap()
    }

    #[test]
    fn test_key_creation() {
        let key = AccountingKey::new(&per_minute(100), "client_a", "GET api/orders").unwrap();

        assert_eq!(key.target, "GET api/orders");
        assert_eq!(key.client, "client_a");
        assert_eq!(key.limit, 100);
        assert_eq!(key.window_nanos, 60_000_000_000);
    }

    #[test]
    fn test_key_to_string() {
        let key = build_key(&per_minute(2), "10.0.0.1", "GET a|b").unwrap();
        assert_eq!(key.to_string_key(), "GET a\\|b|60000000000|2|10.0.0.1");
    }

    #[test]
    fn test_key_equality_follows_policy_signature() {
        let fixed = per_minute(60);
        let custom = RatePolicy::per_period(60, Duration::from_secs(60))
            .unwrap()
            .with_max_burst(7)
            .unwrap();

        let key1 = build_key(&fixed, "client", "target").unwrap();
        let key2 = build_key(&custom, "client", "target").unwrap();
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_distinct_components_distinct_keys() {
        let base = build_key(&per_minute(10), "client", "target").unwrap();

        assert_ne!(base, build_key(&per_minute(11), "client", "target").unwrap());
        assert_ne!(
            base,
            build_key(&RatePolicy::new(10, RateUnit::Hour).unwrap(), "client", "target").unwrap()
        );
        assert_ne!(base, build_key(&per_minute(10), "other", "target").unwrap());
        assert_ne!(base, build_key(&per_minute(10), "client", "other").unwrap());
    }

    #[test]
    fn test_delimiters_do_not_collide() {
        let a = build_key(&per_minute(1), "x|y", "t").unwrap();
        let b = build_key(&per_minute(1), "x", "t|y").unwrap();
        assert_ne!(a.to_string_key(), b.to_string_key());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let policy = per_minute(1);
        assert!(matches!(
            build_key(&policy, "", "target"),
            Err(WardenError::InvalidIdentity(_))
        ));
        assert!(matches!(
            build_key(&policy, "client", ""),
            Err(WardenError::InvalidIdentity(_))
        ));
    }
}
