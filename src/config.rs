//! Configuration management for Quotagate.
//!
//! Everything here is read once at startup. Route declarations and preset
//! overrides are validated while building the engine, so a malformed policy
//! stops the process instead of admitting unlimited traffic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::ratelimit::{
    Clock, CounterStore, EndpointPolicySet, EngineOptions, FailMode, MemoryStore, PolicyResolver,
    Preset, PresetRegistry, ProxyTrust, RateLimitPolicy, RateLimiter, ResolverOptions, RouteTable,
    Scope, Sweeper, WindowAlignment,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `QUOTAGATE__ENGINE__FAIL_MODE=closed`.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Client address extraction
    #[serde(default)]
    pub ip: IpConfig,

    /// Expired counter reclamation
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Preset overrides and additions, by name
    #[serde(default)]
    pub presets: BTreeMap<String, Preset>,

    /// Policies for routes that are not declared below
    #[serde(default)]
    pub default_policies: Vec<PolicyDecl>,

    /// Per-route declarations
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outcome for policies whose counter store is unreachable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Bound on a single counter store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// How new windows are anchored
    #[serde(default)]
    pub window_alignment: WindowAlignment,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            window_alignment: WindowAlignment::default(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// Client address extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpConfig {
    /// Which proxy headers are trusted
    #[serde(default)]
    pub proxy_trust: ProxyTrust,

    /// Apply user policies to the client address of anonymous requests
    #[serde(default)]
    pub fallback_user_to_ip: bool,
}

/// Expired counter reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    300
}

/// One declared policy: a scope plus either a preset name or a literal
/// `(limit, window_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecl {
    pub scope: Scope,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u32>,
    /// Denial message replacing the scope's default
    #[serde(default)]
    pub message: Option<String>,
}

impl PolicyDecl {
    pub fn preset(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            preset: Some(name.into()),
            limit: None,
            window_ms: None,
            message: None,
        }
    }

    pub fn literal(scope: Scope, limit: u32, window_ms: u32) -> Self {
        Self {
            scope,
            preset: None,
            limit: Some(limit),
            window_ms: Some(window_ms),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Turn the declaration into a validated policy.
    pub fn to_policy(&self, presets: &PresetRegistry) -> Result<RateLimitPolicy> {
        let policy = self.base_policy(presets)?;
        Ok(match &self.message {
            Some(message) => policy.with_message(message),
            None => policy,
        })
    }

    fn base_policy(&self, presets: &PresetRegistry) -> Result<RateLimitPolicy> {
        match (&self.preset, self.limit, self.window_ms) {
            (Some(name), None, None) => presets.policy(name, self.scope),
            (None, Some(limit), Some(window_ms)) => {
                RateLimitPolicy::new(self.scope, limit, window_ms)
            }
            (Some(name), _, _) => Err(QuotaError::config(format!(
                "{} policy names preset '{}' and also a literal limit or window",
                self.scope, name
            ))),
            (None, _, _) => Err(QuotaError::config(format!(
                "{} policy needs either a preset or both limit and window_ms",
                self.scope
            ))),
        }
    }
}

/// Declaration for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route identifier, e.g. `POST /auth/login`
    pub route: String,
    #[serde(default)]
    pub policies: Vec<PolicyDecl>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub api_key_scope_only: bool,
}

impl RouteConfig {
    fn to_policy_set(&self, presets: &PresetRegistry) -> Result<EndpointPolicySet> {
        let policies = self
            .policies
            .iter()
            .map(|decl| decl.to_policy(presets))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.in_context(format!("route '{}'", self.route)))?;

        Ok(EndpointPolicySet {
            policies,
            skip: self.skip,
            api_key_scope_only: self.api_key_scope_only,
        })
    }
}

impl QuotaConfig {
    /// Load configuration from a file, with `QUOTAGATE__*` environment
    /// overrides applied on top. The format follows the file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::config(format!("failed to load {}: {}", path.display(), e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::config(format!("failed to parse rate limit config: {}", e)))
    }

    pub fn preset_registry(&self) -> Result<PresetRegistry> {
        PresetRegistry::with_overrides(&self.presets)
    }

    /// Build and validate the route table.
    pub fn route_table(&self, presets: &PresetRegistry) -> Result<RouteTable> {
        let mut table = RouteTable::new();
        for route in &self.routes {
            table.register(route.route.clone(), route.to_policy_set(presets)?)?;
        }

        let fallback = self
            .default_policies
            .iter()
            .map(|decl| decl.to_policy(presets))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.in_context("default policies"))?;
        table.set_fallback(EndpointPolicySet::new(fallback));
        Ok(table)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            fail_mode: self.engine.fail_mode,
            store_timeout: Duration::from_millis(self.engine.store_timeout_ms),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            proxy_trust: self.ip.proxy_trust,
            fallback_user_to_ip: self.ip.fallback_user_to_ip,
        }
    }

    /// An in-memory counter store with the configured window alignment.
    pub fn memory_store(&self) -> MemoryStore {
        MemoryStore::with_alignment(self.engine.window_alignment)
    }

    /// Validate every declaration and assemble the engine.
    pub fn build_limiter(
        &self,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<RateLimiter> {
        if self.engine.store_timeout_ms == 0 {
            return Err(QuotaError::config("store_timeout_ms must be greater than 0"));
        }
        let presets = self.preset_registry()?;
        let routes = self.route_table(&presets)?;
        info!(
            routes = routes.len(),
            presets = presets.len(),
            fail_mode = ?self.engine.fail_mode,
            "Rate limit policies registered"
        );

        let resolver = PolicyResolver::new(routes, self.resolver_options());
        Ok(RateLimiter::new(store, resolver, clock, self.engine_options()))
    }

    /// The configured sweeper, or `None` when sweeping is disabled.
    pub fn sweeper(
        &self,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Option<Sweeper>> {
        if !self.sweeper.enabled {
            return Ok(None);
        }
        Sweeper::new(store, clock, Duration::from_secs(self.sweeper.interval_secs)).map(Some)
    }
}
