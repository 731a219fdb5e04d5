//! Named limit presets.
//!
//! The registry is built once at startup, optionally with overrides from
//! configuration, and is read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::policy::{RateLimitPolicy, Scope};
use crate::error::{QuotaError, Result};

const MINUTE_MS: u32 = 60 * 1000;
const QUARTER_HOUR_MS: u32 = 15 * MINUTE_MS;
const HOUR_MS: u32 = 60 * MINUTE_MS;

/// A named `(limit, window)` pair, not yet bound to a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Requests allowed per window
    pub limit: u32,
    /// Window length in milliseconds
    pub window_ms: u32,
}

impl Preset {
    pub const fn new(limit: u32, window_ms: u32) -> Self {
        Self { limit, window_ms }
    }

    /// Bind this preset to a scope.
    pub fn policy(&self, scope: Scope) -> Result<RateLimitPolicy> {
        RateLimitPolicy::new(scope, self.limit, self.window_ms)
    }
}

/// Presets available without any configuration.
pub const BUILTIN_PRESETS: &[(&str, Preset)] = &[
    // Sensitive operations
    ("strict", Preset::new(5, QUARTER_HOUR_MS)),
    // Login and auth endpoints
    ("conservative", Preset::new(10, QUARTER_HOUR_MS)),
    ("standard", Preset::new(100, QUARTER_HOUR_MS)),
    // Read-only operations
    ("generous", Preset::new(1000, QUARTER_HOUR_MS)),
    ("per_minute_strict", Preset::new(5, MINUTE_MS)),
    ("per_minute_standard", Preset::new(60, MINUTE_MS)),
    ("per_minute_generous", Preset::new(300, MINUTE_MS)),
    ("per_hour_strict", Preset::new(100, HOUR_MS)),
    ("per_hour_standard", Preset::new(1000, HOUR_MS)),
    ("per_hour_generous", Preset::new(10000, HOUR_MS)),
];

/// Failed sign-in attempts allowed per account identifier.
pub const LOGIN_ATTEMPTS: Preset = Preset::new(5, QUARTER_HOUR_MS);

/// Password reset requests allowed per email address.
pub const PASSWORD_RESET_ATTEMPTS: Preset = Preset::new(3, HOUR_MS);

/// Read-only lookup from preset name to preset.
#[derive(Debug, Clone)]
pub struct PresetRegistry {
    presets: BTreeMap<String, Preset>,
}

impl PresetRegistry {
    /// A registry holding only the built-in presets.
    pub fn builtin() -> Self {
        let presets = BUILTIN_PRESETS
            .iter()
            .map(|(name, preset)| (name.to_string(), *preset))
            .collect();
        Self { presets }
    }

    /// The built-in presets with `overrides` applied on top.
    ///
    /// Overrides replace built-in values of the same name or add new presets.
    /// Every override is validated.
    pub fn with_overrides<'a, I>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a Preset)>,
    {
        let mut registry = Self::builtin();
        for (name, preset) in overrides {
            // Validate with an arbitrary scope; presets are scope-agnostic.
            preset
                .policy(Scope::Global)
                .map_err(|e| e.in_context(format!("preset '{}'", name)))?;
            registry.presets.insert(normalize(name), *preset);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets.get(&normalize(name)).copied()
    }

    /// Resolve a preset by name and bind it to `scope`.
    pub fn policy(&self, name: &str, scope: Scope) -> Result<RateLimitPolicy> {
        let preset = self
            .get(name)
            .ok_or_else(|| QuotaError::config(format!("unknown rate limit preset '{}'", name)))?;
        preset.policy(scope)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

impl Default for PresetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_presets() {
        let registry = PresetRegistry::builtin();

        assert_eq!(registry.len(), 10);
        assert_eq!(registry.get("strict"), Some(Preset::new(5, 900_000)));
        assert_eq!(registry.get("per_minute_standard"), Some(Preset::new(60, 60_000)));
        assert_eq!(registry.get("per_hour_generous"), Some(Preset::new(10_000, 3_600_000)));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = PresetRegistry::builtin();
        assert_eq!(registry.get("STRICT"), registry.get("strict"));
        assert_eq!(registry.get("Per-Minute-Strict"), Some(Preset::new(5, 60_000)));
    }

    #[test]
    fn test_policy_binds_scope() {
        let registry = PresetRegistry::builtin();
        let policy = registry.policy("conservative", Scope::User).unwrap();

        assert_eq!(policy.scope(), Scope::User);
        assert_eq!(policy.limit(), 10);
        assert_eq!(policy.window_ms(), 900_000);
    }

    #[test]
    fn test_unknown_preset_is_config_error() {
        let registry = PresetRegistry::builtin();
        let err = registry.policy("lenient", Scope::Ip).unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let mut overrides = BTreeMap::new();
        overrides.insert("strict".to_string(), Preset::new(3, 60_000));
        overrides.insert("search".to_string(), Preset::new(1000, 3_600_000));

        let registry = PresetRegistry::with_overrides(&overrides).unwrap();

        assert_eq!(registry.get("strict"), Some(Preset::new(3, 60_000)));
        assert_eq!(registry.get("search"), Some(Preset::new(1000, 3_600_000)));
        assert_eq!(registry.len(), 11);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("broken".to_string(), Preset::new(0, 60_000));

        let err = PresetRegistry::with_overrides(&overrides).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
