//! Permission Evaluation
//!
//! Permission sets are finite sets of patterns evaluated by pure functions.
//! A pattern is either `*` (anything), a prefix glob ending in `*`
//! (`claude-*`), or an exact name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Allowed endpoints and models plus collaborator-checked capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    /// Endpoint patterns the account may call
    pub allowed_endpoints: BTreeSet<String>,

    /// Model patterns the account may use
    pub allowed_models: BTreeSet<String>,

    /// Checked by the settings collaborator, not by `authorize`
    pub can_modify_settings: bool,

    /// Checked by the API-key collaborator, not by `authorize`
    pub can_create_api_keys: bool,
}

impl PermissionSet {
    /// Permission set allowing every endpoint and model
    pub fn allow_all() -> Self {
        Self {
            allowed_endpoints: BTreeSet::from(["*".to_string()]),
            allowed_models: BTreeSet::from(["*".to_string()]),
            can_modify_settings: true,
            can_create_api_keys: true,
        }
    }

    /// Build from endpoint and model pattern lists
    pub fn new<E, M>(endpoints: E, models: M) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            allowed_endpoints: endpoints.into_iter().map(Into::into).collect(),
            allowed_models: models.into_iter().map(Into::into).collect(),
            can_modify_settings: false,
            can_create_api_keys: false,
        }
    }

    /// Narrow this (sub-account) set to what `parent` also allows
    pub fn restrict_to(&self, parent: &PermissionSet) -> PermissionSet {
        PermissionSet {
            allowed_endpoints: intersect(&self.allowed_endpoints, &parent.allowed_endpoints),
            allowed_models: intersect(&self.allowed_models, &parent.allowed_models),
            can_modify_settings: self.can_modify_settings && parent.can_modify_settings,
            can_create_api_keys: self.can_create_api_keys && parent.can_create_api_keys,
        }
    }
}

/// Result of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny(String),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allow)
    }
}

/// Check an (endpoint, model) pair against a resolved permission set
pub fn authorize(permissions: &PermissionSet, endpoint: &str, model: &str) -> Authorization {
    if !matches_any(&permissions.allowed_endpoints, endpoint) {
        return Authorization::Deny(format!("endpoint '{endpoint}' is not allowed"));
    }
    if !matches_any(&permissions.allowed_models, model) {
        return Authorization::Deny(format!("model '{model}' is not allowed"));
    }
    Authorization::Allow
}

/// Whether `pattern` matches `value`
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

fn matches_any(patterns: &BTreeSet<String>, value: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, value))
}

/// Whether every value matched by `inner` is also matched by `outer`
fn covers(outer: &str, inner: &str) -> bool {
    match (outer.strip_suffix('*'), inner.strip_suffix('*')) {
        (Some(outer_prefix), Some(inner_prefix)) => inner_prefix.starts_with(outer_prefix),
        (Some(outer_prefix), None) => inner.starts_with(outer_prefix),
        (None, Some(_)) => false,
        (None, None) => outer == inner,
    }
}

fn intersect(child: &BTreeSet<String>, parent: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for c in child {
        if parent.iter().any(|p| covers(p, c)) {
            out.insert(c.clone());
        }
    }
    for p in parent {
        if child.iter().any(|c| covers(c, p)) {
            out.insert(p.clone());
        }
    }
    // Drop patterns already implied by a broader member.
    let snapshot = out.clone();
    out.retain(|a| !snapshot.iter().any(|b| b != a && covers(b, a)));
    out
}
