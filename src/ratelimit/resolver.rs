//! Route policy declarations and per-request policy resolution.
//!
//! Routes register an [`EndpointPolicySet`] once at startup. For every
//! request the resolver turns the route's declared policies into concrete
//! `(policy, scope key)` checks using the identities the request carries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::trace;

use super::counter::CounterKey;
use super::policy::{RateLimitPolicy, Scope, ScopeKey};
use crate::error::{QuotaError, Result};

/// Key used for IP checks when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Identities extracted from an inbound request by the surrounding system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated user id
    #[serde(default)]
    pub user_id: Option<String>,
    /// Id of the validated API key presented with the request
    #[serde(default)]
    pub api_key_id: Option<String>,
    /// Socket peer address, with or without port
    #[serde(default)]
    pub peer_addr: Option<String>,
    /// Raw `X-Forwarded-For` header value
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header value
    #[serde(default)]
    pub real_ip: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    pub fn with_peer(mut self, peer_addr: impl Into<String>) -> Self {
        self.peer_addr = Some(peer_addr.into());
        self
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    pub fn with_real_ip(mut self, header: impl Into<String>) -> Self {
        self.real_ip = Some(header.into());
        self
    }
}

/// Which proxy headers are trusted when extracting the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTrust {
    /// Only the socket peer address is used.
    #[default]
    None,
    /// The left-most `X-Forwarded-For` entry, falling back to the peer.
    ForwardedFor,
    /// `X-Real-IP`, falling back to the peer.
    RealIp,
    /// `X-Forwarded-For`, then `X-Real-IP`, then the peer.
    Any,
}

impl ProxyTrust {
    /// Extract and normalize the client address of a request.
    pub fn client_ip(&self, ctx: &RequestContext) -> Option<String> {
        let forwarded = || {
            ctx.forwarded_for
                .as_deref()
                .and_then(|header| header.split(',').next())
                .and_then(normalize_ip)
        };
        let real_ip = || ctx.real_ip.as_deref().and_then(normalize_ip);
        let peer = || ctx.peer_addr.as_deref().and_then(normalize_ip);

        match self {
            ProxyTrust::None => peer(),
            ProxyTrust::ForwardedFor => forwarded().or_else(peer),
            ProxyTrust::RealIp => real_ip().or_else(peer),
            ProxyTrust::Any => forwarded().or_else(real_ip).or_else(peer),
        }
    }
}

/// Normalize a client address: strip ports and brackets, and unwrap
/// IPv4-mapped IPv6 addresses.
pub fn normalize_ip(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let ip = if let Ok(addr) = raw.parse::<SocketAddr>() {
        addr.ip()
    } else {
        let unbracketed = raw.trim_start_matches('[').trim_end_matches(']');
        unbracketed.parse::<IpAddr>().ok()?
    };

    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    Some(ip.to_string())
}

/// Rate limiting declared for one route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointPolicySet {
    pub policies: Vec<RateLimitPolicy>,
    /// Bypass all limiting for this route
    pub skip: bool,
    /// Requests presenting an API key are limited by `ApiKey` policies only
    pub api_key_scope_only: bool,
}

impl EndpointPolicySet {
    pub fn new(policies: Vec<RateLimitPolicy>) -> Self {
        Self {
            policies,
            ..Self::default()
        }
    }

    /// A route that is never limited.
    pub fn skipped() -> Self {
        Self {
            skip: true,
            ..Self::default()
        }
    }

    pub fn with_api_key_scope_only(mut self) -> Self {
        self.api_key_scope_only = true;
        self
    }
}

/// Immutable table of route declarations.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, EndpointPolicySet>,
    fallback: EndpointPolicySet,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route's policies. Registering the same route twice fails.
    pub fn register(&mut self, route: impl Into<String>, set: EndpointPolicySet) -> Result<()> {
        let route = route.into();
        if self.routes.contains_key(&route) {
            return Err(QuotaError::config(format!(
                "route '{}' registered more than once",
                route
            )));
        }
        self.routes.insert(route, set);
        Ok(())
    }

    /// Policies applied to requests for routes that were never registered.
    pub fn set_fallback(&mut self, set: EndpointPolicySet) {
        self.fallback = set;
    }

    pub fn get(&self, route: &str) -> &EndpointPolicySet {
        self.routes.get(route).unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Resolver behaviour that does not depend on the route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    pub proxy_trust: ProxyTrust,
    /// Apply `User` policies to the client address of anonymous requests
    pub fallback_user_to_ip: bool,
}

/// One policy bound to the bucket it is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCheck {
    pub policy: RateLimitPolicy,
    pub key: ScopeKey,
}

impl ResolvedCheck {
    /// The counter this check is recorded against.
    pub fn counter_key(&self) -> CounterKey {
        CounterKey::new(self.key.clone(), self.policy.window_ms())
    }
}

/// Checks for one request, ordered by scope priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPolicySet {
    checks: Vec<ResolvedCheck>,
}

impl ResolvedPolicySet {
    pub fn checks(&self) -> &[ResolvedCheck] {
        &self.checks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResolvedCheck> {
        self.checks.iter()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Order checks by scope priority and collapse checks that count against
    /// the same counter to the one with the lowest limit.
    ///
    /// Checks on one identity with different windows are separate counters
    /// and are all kept.
    pub fn from_checks(mut checks: Vec<ResolvedCheck>) -> Self {
        checks.sort_by_key(|check| check.key.scope().priority());

        let mut positions: HashMap<CounterKey, usize> = HashMap::new();
        let mut deduped: Vec<ResolvedCheck> = Vec::with_capacity(checks.len());
        for check in checks {
            let counter = check.counter_key();
            match positions.get(&counter) {
                Some(&idx) => {
                    if check.policy.limit() < deduped[idx].policy.limit() {
                        deduped[idx] = check;
                    }
                }
                None => {
                    positions.insert(counter, deduped.len());
                    deduped.push(check);
                }
            }
        }
        Self { checks: deduped }
    }
}

impl<'a> IntoIterator for &'a ResolvedPolicySet {
    type Item = &'a ResolvedCheck;
    type IntoIter = std::slice::Iter<'a, ResolvedCheck>;

    fn into_iter(self) -> Self::IntoIter {
        self.checks.iter()
    }
}

/// Turns route declarations into concrete checks for a request.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    routes: RouteTable,
    options: ResolverOptions,
}

impl PolicyResolver {
    pub fn new(routes: RouteTable, options: ResolverOptions) -> Self {
        Self { routes, options }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn options(&self) -> ResolverOptions {
        self.options
    }

    /// Resolve the checks that apply to a request on `route`.
    pub fn resolve(&self, route: &str, ctx: &RequestContext) -> ResolvedPolicySet {
        let set = self.routes.get(route);
        if set.skip {
            trace!(route = %route, "Rate limiting skipped for route");
            return ResolvedPolicySet::default();
        }

        let api_key_only = set.api_key_scope_only && ctx.api_key_id.is_some();
        let checks = set
            .policies
            .iter()
            .filter(|policy| !api_key_only || policy.scope() == Scope::ApiKey)
            .filter_map(|policy| self.bind(policy, ctx))
            .collect();

        let resolved = ResolvedPolicySet::from_checks(checks);
        trace!(route = %route, checks = resolved.len(), "Resolved rate limit policies");
        resolved
    }

    fn bind(&self, policy: &RateLimitPolicy, ctx: &RequestContext) -> Option<ResolvedCheck> {
        let policy = policy.clone();
        let (policy, key) = match policy.scope() {
            Scope::Global => (policy, ScopeKey::Global),
            Scope::ApiKey => (policy, ScopeKey::ApiKey(ctx.api_key_id.clone()?)),
            Scope::User => match &ctx.user_id {
                Some(id) => (policy, ScopeKey::User(id.clone())),
                None if self.options.fallback_user_to_ip => {
                    (policy.with_scope(Scope::Ip), ScopeKey::Ip(self.client_ip(ctx)))
                }
                None => return None,
            },
            Scope::Ip => (policy, ScopeKey::Ip(self.client_ip(ctx))),
            Scope::General => (policy, ScopeKey::General(self.requester_key(ctx))),
        };
        Some(ResolvedCheck { policy, key })
    }

    fn client_ip(&self, ctx: &RequestContext) -> String {
        self.options
            .proxy_trust
            .client_ip(ctx)
            .unwrap_or_else(|| UNKNOWN_IP.to_string())
    }

    /// The user, else the API key, else the client address.
    fn requester_key(&self, ctx: &RequestContext) -> String {
        if let Some(user_id) = &ctx.user_id {
            format!("user:{}", user_id)
        } else if let Some(api_key_id) = &ctx.api_key_id {
            format!("api_key:{}", api_key_id)
        } else {
            format!("ip:{}", self.client_ip(ctx))
        }
    }
}
