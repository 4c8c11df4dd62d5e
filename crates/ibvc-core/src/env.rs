//! The build's accumulated environment and the `VCS_*` key scheme.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Effective config path used for checkout.
pub const VCS_CONFIG: &str = "VCS_CONFIG";
/// Requested target revision.
pub const VCS_TARGET_REV: &str = "VCS_TARGET_REV";
/// Prefix of one entry per custom parameter.
pub const VCS_PARAM_PREFIX: &str = "VCS_PARAM_";
/// Resolved tool-side revision.
pub const VCS_BEST_MATCH_TOOL_REV: &str = "VCS_BEST_MATCH_TOOL_REV";
/// Resolved VCS-side revision.
pub const VCS_BEST_MATCH_VCS_REV: &str = "VCS_BEST_MATCH_VCS_REV";

/// Environment key for a custom parameter.
pub fn param_key(name: &str) -> String {
    format!("{VCS_PARAM_PREFIX}{name}")
}

/// Variable name to string value, first writer wins.
///
/// Keys iterate in sorted order so anything derived from the map
/// (parameter lists, argument vectors) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentMap {
    vars: BTreeMap<String, String>,
}

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` under `key` unless the key is already set.
    ///
    /// Returns `true` when the value was written.
    pub fn publish(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.vars.contains_key(&key) {
            tracing::debug!(key = %key, "environment key already set, keeping first value");
            return false;
        }
        self.vars.insert(key, value.into());
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Custom parameters published under `VCS_PARAM_<name>`, prefix stripped.
    pub fn parameters(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(VCS_PARAM_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }

    /// All `VCS_*` variables, the subset this bridge owns.
    pub fn vcs_vars(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter(|(k, _)| k.starts_with("VCS_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Substitute `$NAME` and `${NAME}` references with their values.
    ///
    /// Unknown references are left untouched.
    pub fn expand(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }
        reference_pattern()
            .replace_all(input, |caps: &Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.vars.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl FromIterator<(String, String)> for EnvironmentMap {
    /// Collects with first-writer-wins semantics.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut env = EnvironmentMap::new();
        for (k, v) in iter {
            env.publish(k, v);
        }
        env
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable reference pattern is valid")
    })
}
