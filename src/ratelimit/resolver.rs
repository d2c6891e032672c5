//! Policy resolution between target and group scopes.

use super::policy::RatePolicy;

/// Policies declared for one target, at target scope and group scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    /// Policies declared on the target itself
    pub target: Vec<RatePolicy>,
    /// Policies declared on the group enclosing the target
    pub group: Vec<RatePolicy>,
}

impl PolicySet {
    pub fn new(target: Vec<RatePolicy>, group: Vec<RatePolicy>) -> Self {
        Self { target, group }
    }

    /// The effective, ordered policies for this target.
    pub fn resolve(&self) -> &[RatePolicy] {
        resolve(&self.target, &self.group)
    }
}

/// Pick the effective policies: target scope replaces group scope whenever
/// it declares anything. The two scopes are never merged.
///
/// An empty result means no limiting applies to the target.
pub fn resolve<'a>(target: &'a [RatePolicy], group: &'a [RatePolicy]) -> &'a [RatePolicy] {
    if target.is_empty() {
        group
    } else {
        target
    }
}
