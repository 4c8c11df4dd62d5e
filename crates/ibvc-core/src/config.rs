//! Phase configuration and its resolution against the build environment.
//!
//! Each phase carries its own [`PhaseConfig`]. [`resolve`] decides, per
//! [`Precedence`], whether the phase's values or the values published by an
//! earlier phase take effect.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::{EnvironmentMap, VCS_CONFIG, VCS_TARGET_REV};
use crate::error::{BridgeError, Result};

/// A custom `--param-<name> <value>` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Flags that only apply to the checkin operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinOptions {
    #[serde(default)]
    pub keep: bool,
    #[serde(default)]
    pub purge_other: bool,
}

/// Configuration supplied by the host for one phase invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub target_revision: Option<String>,
    #[serde(default)]
    pub additional_arguments: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub override_inherited: bool,
    #[serde(flatten)]
    pub checkin: CheckinOptions,
}

impl PhaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_target_revision(mut self, rev: impl Into<String>) -> Self {
        self.target_revision = Some(rev.into());
        self
    }

    pub fn with_additional_arguments(mut self, args: impl Into<String>) -> Self {
        self.additional_arguments = Some(args.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn overriding(mut self) -> Self {
        self.override_inherited = true;
        self
    }

    pub fn with_checkin(mut self, keep: bool, purge_other: bool) -> Self {
        self.checkin = CheckinOptions { keep, purge_other };
        self
    }

    /// Reject parameter lists that name the same parameter twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for p in &self.parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(BridgeError::InvalidConfig(format!(
                    "duplicate parameter: {}",
                    p.name
                )));
            }
        }
        Ok(())
    }
}

/// How a phase's own configuration relates to what is already published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// Published values win; the phase only fills gaps. Build-setup.
    Inherit,
    /// The phase replaces published config and parameters wholesale when it
    /// asks to and names a config path. Checkout and post-build save.
    OverrideIfRequested,
}

/// Configuration as it takes effect for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub config_path: Option<String>,
    pub target_revision: Option<String>,
    pub additional_arguments: Option<String>,
    pub parameters: Vec<Parameter>,
    pub checkin: CheckinOptions,
}

/// Resolve a phase's effective configuration. Pure.
///
/// Under [`Precedence::Inherit`] the config path and the parameter set are
/// resolved independently, each taken from the environment when published
/// there and from the phase otherwise. Under
/// [`Precedence::OverrideIfRequested`] they travel together: both come from
/// the environment when it holds either, never a mix of the two.
/// Parameters are never merged key by key.
pub fn resolve(
    phase: &PhaseConfig,
    env: &EnvironmentMap,
    precedence: Precedence,
) -> EffectiveConfig {
    let own_path = phase.config_path.as_deref().and_then(normalize_config_path);
    let own_target = phase.target_revision.as_deref().and_then(non_empty);
    let inherited_target = env.get(VCS_TARGET_REV).and_then(non_empty);

    let overriding = precedence == Precedence::OverrideIfRequested
        && phase.override_inherited
        && own_path.is_some();

    let inherited_path = env.get(VCS_CONFIG).and_then(non_empty);
    let inherited_params: Vec<Parameter> = env
        .parameters()
        .into_iter()
        .map(|(name, value)| Parameter { name, value })
        .collect();

    let (config_path, parameters) = if overriding {
        (own_path, phase.parameters.clone())
    } else if precedence == Precedence::Inherit {
        let params = if inherited_params.is_empty() {
            phase.parameters.clone()
        } else {
            inherited_params
        };
        (inherited_path.or(own_path), params)
    } else if inherited_path.is_some() || !inherited_params.is_empty() {
        (inherited_path, inherited_params)
    } else {
        (own_path, phase.parameters.clone())
    };

    let target_revision = match precedence {
        Precedence::Inherit => inherited_target.or(own_target),
        Precedence::OverrideIfRequested => own_target.or(inherited_target),
    };

    EffectiveConfig {
        config_path,
        target_revision,
        additional_arguments: phase.additional_arguments.as_deref().and_then(non_empty),
        parameters,
        checkin: phase.checkin,
    }
}

/// Normalize a config path to the host's canonical form.
///
/// Duplicate and trailing separators collapse, and interior `.` segments
/// are dropped as well (`a/./b` becomes `a/b`). `..` is kept. Empty strings
/// mean "not provided". Nothing touches the filesystem; a malformed path is
/// passed on for the tool to judge.
pub fn normalize_config_path(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let normalized: std::path::PathBuf = Path::new(raw).components().collect();
    let normalized = normalized.to_string_lossy().into_owned();
    if normalized.is_empty() {
        Some(raw.to_string())
    } else {
        Some(normalized)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::param_key;

    fn env_with_inherited() -> EnvironmentMap {
        let mut env = EnvironmentMap::new();
        env.publish(VCS_CONFIG, "/inherited/cfg");
        env.publish(param_key("ARCH"), "arm");
        env.publish(param_key("MODE"), "debug");
        env
    }

    #[test]
    fn test_no_override_takes_environment() {
        let env = env_with_inherited();
        let phase = PhaseConfig::new()
            .with_config_path("/own/cfg")
            .with_parameter("ARCH", "x86");

        let eff = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(eff.config_path.as_deref(), Some("/inherited/cfg"));
        assert_eq!(
            eff.parameters,
            vec![Parameter::new("ARCH", "arm"), Parameter::new("MODE", "debug")]
        );
    }

    #[test]
    fn test_override_replaces_wholesale_even_with_no_parameters() {
        let env = env_with_inherited();
        let phase = PhaseConfig::new().with_config_path("/own/cfg").overriding();

        let eff = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(eff.config_path.as_deref(), Some("/own/cfg"));
        assert!(eff.parameters.is_empty());
    }

    #[test]
    fn test_override_without_path_falls_back() {
        let env = env_with_inherited();
        let phase = PhaseConfig::new()
            .with_config_path("")
            .with_parameter("ARCH", "x86")
            .overriding();

        let eff = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(eff.config_path.as_deref(), Some("/inherited/cfg"));
        assert_eq!(eff.parameters.len(), 2);
    }

    #[test]
    fn test_empty_environment_uses_phase_values() {
        let env = EnvironmentMap::new();
        let phase = PhaseConfig::new()
            .with_config_path("/repo/cfg")
            .with_target_revision("HEAD")
            .with_parameter("ARCH", "x86");

        let eff = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(eff.config_path.as_deref(), Some("/repo/cfg"));
        assert_eq!(eff.target_revision.as_deref(), Some("HEAD"));
        assert_eq!(eff.parameters, vec![Parameter::new("ARCH", "x86")]);
    }

    #[test]
    fn test_inherit_ignores_override_flag() {
        let env = env_with_inherited();
        let phase = PhaseConfig::new().with_config_path("/own/cfg").overriding();

        let eff = resolve(&phase, &env, Precedence::Inherit);
        assert_eq!(eff.config_path.as_deref(), Some("/inherited/cfg"));
    }

    #[test]
    fn test_inherit_falls_back_to_own_parameters() {
        let mut env = EnvironmentMap::new();
        env.publish(VCS_CONFIG, "/inherited/cfg");
        let phase = PhaseConfig::new()
            .with_config_path("/own/cfg")
            .with_parameter("ARCH", "x86");

        let eff = resolve(&phase, &env, Precedence::Inherit);
        assert_eq!(eff.config_path.as_deref(), Some("/inherited/cfg"));
        assert_eq!(eff.parameters, vec![Parameter::new("ARCH", "x86")]);
    }

    #[test]
    fn test_inherit_falls_back_to_own_config_path() {
        let mut env = EnvironmentMap::new();
        env.publish(param_key("ARCH"), "arm");
        let phase = PhaseConfig::new()
            .with_config_path("/own/cfg")
            .with_parameter("ARCH", "x86")
            .with_parameter("MODE", "release");

        let eff = resolve(&phase, &env, Precedence::Inherit);
        assert_eq!(eff.config_path.as_deref(), Some("/own/cfg"));
        assert_eq!(eff.parameters, vec![Parameter::new("ARCH", "arm")]);
    }

    #[test]
    fn test_no_override_keeps_path_and_parameters_together() {
        let mut env = EnvironmentMap::new();
        env.publish(VCS_CONFIG, "/inherited/cfg");
        let phase = PhaseConfig::new()
            .with_config_path("/own/cfg")
            .with_parameter("ARCH", "x86");

        let eff = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(eff.config_path.as_deref(), Some("/inherited/cfg"));
        assert!(eff.parameters.is_empty());
    }

    #[test]
    fn test_target_revision_precedence() {
        let mut env = EnvironmentMap::new();
        env.publish(VCS_TARGET_REV, "v1");
        let phase = PhaseConfig::new().with_target_revision("v2");

        let inherit = resolve(&phase, &env, Precedence::Inherit);
        assert_eq!(inherit.target_revision.as_deref(), Some("v1"));

        let own = resolve(&phase, &env, Precedence::OverrideIfRequested);
        assert_eq!(own.target_revision.as_deref(), Some("v2"));
    }

    #[test]
    fn test_empty_strings_are_not_provided() {
        let phase = PhaseConfig::new()
            .with_config_path("")
            .with_target_revision("")
            .with_additional_arguments("");

        let eff = resolve(&phase, &EnvironmentMap::new(), Precedence::OverrideIfRequested);
        assert_eq!(eff, EffectiveConfig::default());
    }

    #[test]
    fn test_normalize_config_path() {
        assert_eq!(normalize_config_path(""), None);
        assert_eq!(
            normalize_config_path("/repo//cfg/").as_deref(),
            Some("/repo/cfg")
        );
        assert_eq!(
            normalize_config_path("cfg/./ibvc.config").as_deref(),
            Some("cfg/ibvc.config")
        );
        assert_eq!(
            normalize_config_path("/repo/../cfg").as_deref(),
            Some("/repo/../cfg")
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_parameters() {
        let phase = PhaseConfig::new()
            .with_parameter("ARCH", "x86")
            .with_parameter("ARCH", "arm");
        assert!(matches!(
            phase.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
        assert!(PhaseConfig::new().with_parameter("ARCH", "x86").validate().is_ok());
    }

    #[test]
    fn test_phase_config_from_toml() {
        let phase: PhaseConfig = toml::from_str(
            r#"
            config_path = "/repo/cfg"
            override_inherited = true
            keep = true

            [[parameters]]
            name = "ARCH"
            value = "x86"
            "#,
        )
        .unwrap();

        assert_eq!(phase.config_path.as_deref(), Some("/repo/cfg"));
        assert!(phase.override_inherited);
        assert!(phase.checkin.keep);
        assert!(!phase.checkin.purge_other);
        assert_eq!(phase.parameters, vec![Parameter::new("ARCH", "x86")]);
    }
}
