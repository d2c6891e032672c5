//! Declarative policy registry.
//!
//! Maps target identities to the policies declared on them and on their
//! enclosing group. The registry is built once from configuration and only
//! read afterwards; the engine receives the resulting [`PolicySet`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::policy::{PolicyDeclaration, RatePolicy};
use super::resolver::PolicySet;
use crate::error::{Result, WardenError};

/// Policy declarations for all targets and groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Groups of targets sharing general policies
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Targets with their specific policies
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Policies declared on a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub policies: Vec<PolicyDeclaration>,
}

/// Policies declared on a single target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target identity, e.g. `GET api/orders/{id}`
    pub target: String,
    /// Optional enclosing group
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyDeclaration>,
}

#[derive(Debug, Clone)]
struct TargetEntry {
    group: Option<String>,
    policies: Vec<RatePolicy>,
}

/// Target identity to policy set lookup.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    groups: HashMap<String, Vec<RatePolicy>>,
    targets: HashMap<String, TargetEntry>,
}

impl TargetRegistry {
    pub fn builder() -> TargetRegistryBuilder {
        TargetRegistryBuilder::default()
    }

    /// Validate every declaration and build the registry.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut builder = Self::builder();

        for group in &config.groups {
            builder = builder.group(&group.name, declared(&group.policies, &group.name)?);
        }
        for target in &config.targets {
            builder = builder.target(
                &target.target,
                target.group.as_deref(),
                declared(&target.policies, &target.target)?,
            );
        }

        builder.build()
    }

    /// Load a registry from a YAML policy document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PolicyConfig = serde_yaml::from_str(yaml).map_err(|e| {
            WardenError::Configuration(format!("Failed to parse policy config: {}", e))
        })?;
        Self::from_config(&config)
    }

    /// Policies that apply to `target`, at both scopes.
    ///
    /// Unknown targets get an empty set, meaning no limiting applies.
    pub fn policy_set(&self, target: &str) -> PolicySet {
        let Some(entry) = self.targets.get(target) else {
            return PolicySet::default();
        };

        let group = entry
            .group
            .as_ref()
            .and_then(|name| self.groups.get(name))
            .cloned()
            .unwrap_or_default();

        PolicySet::new(entry.policies.clone(), group)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

fn declared(declarations: &[PolicyDeclaration], owner: &str) -> Result<Vec<RatePolicy>> {
    declarations
        .iter()
        .map(|decl| {
            RatePolicy::try_from(decl).map_err(|e| {
                WardenError::Configuration(format!("invalid policy on '{}': {}", owner, e))
            })
        })
        .collect()
}

/// Incremental construction of a [`TargetRegistry`].
#[derive(Debug, Default)]
pub struct TargetRegistryBuilder {
    groups: Vec<(String, Vec<RatePolicy>)>,
    targets: Vec<(String, Option<String>, Vec<RatePolicy>)>,
}

impl TargetRegistryBuilder {
    /// Declare a group and its general policies.
    pub fn group(mut self, name: &str, policies: Vec<RatePolicy>) -> Self {
        self.groups.push((name.to_string(), policies));
        self
    }

    /// Declare a target, its optional group and its specific policies.
    pub fn target(mut self, target: &str, group: Option<&str>, policies: Vec<RatePolicy>) -> Self {
        self.targets
            .push((target.to_string(), group.map(str::to_string), policies));
        self
    }

    /// Check names and group references, then build.
    pub fn build(self) -> Result<TargetRegistry> {
        let mut registry = TargetRegistry::default();

        for (name, policies) in self.groups {
            if name.is_empty() {
                return Err(WardenError::Configuration("group name is empty".to_string()));
            }
            check_bursts(&name, &policies)?;
            if registry.groups.insert(name.clone(), policies).is_some() {
                return Err(WardenError::Configuration(format!(
                    "group '{}' declared twice",
                    name
                )));
            }
        }

        for (target, group, policies) in self.targets {
            if target.is_empty() {
                return Err(WardenError::Configuration("target identity is empty".to_string()));
            }
            check_bursts(&target, &policies)?;
            if let Some(ref name) = group {
                if !registry.groups.contains_key(name) {
                    return Err(WardenError::Configuration(format!(
                        "target '{}' references unknown group '{}'",
                        target, name
                    )));
                }
            }
            let entry = TargetEntry { group, policies };
            if registry.targets.insert(target.clone(), entry).is_some() {
                return Err(WardenError::Configuration(format!(
                    "target '{}' declared twice",
                    target
                )));
            }
        }

        info!(
            targets = registry.targets.len(),
            groups = registry.groups.len(),
            "Policy registry loaded"
        );

        Ok(registry)
    }
}

/// Equal policies share a bucket, so one scope may not declare them with
/// two different bursts.
fn check_bursts(scope: &str, policies: &[RatePolicy]) -> Result<()> {
    for (i, policy) in policies.iter().enumerate() {
        let conflict = policies[..i]
            .iter()
            .find(|earlier| *earlier == policy && earlier.max_burst() != policy.max_burst());
        if let Some(earlier) = conflict {
            return Err(WardenError::Configuration(format!(
                "'{}' declares {} with bursts {} and {}",
                scope,
                policy,
                earlier.max_burst(),
                policy.max_burst()
            )));
        }
    }
    Ok(())
}
