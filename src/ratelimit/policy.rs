//! Rate limit scopes, policies and scope keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{QuotaError, Result};

/// A partition dimension for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One bucket shared by every request
    Global,
    /// One bucket per authenticated user
    User,
    /// One bucket per presented API key
    ApiKey,
    /// One bucket per client address
    Ip,
    /// One bucket per requester: the user, else the API key, else the
    /// client address. Also used for caller-named keys such as login
    /// attempts per account.
    General,
}

impl Scope {
    /// Evaluation priority; lower values are checked and reported first.
    ///
    /// Per-identity scopes come before the client address, which comes
    /// before the general and global buckets.
    pub fn priority(&self) -> u8 {
        match self {
            Scope::ApiKey => 0,
            Scope::User => 1,
            Scope::Ip => 2,
            Scope::General => 3,
            Scope::Global => 4,
        }
    }

    /// Machine-readable denial reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Scope::Global => "global_rate_limit",
            Scope::User => "user_rate_limit",
            Scope::ApiKey => "api_key_rate_limit",
            Scope::Ip => "ip_rate_limit",
            Scope::General => "rate_limit",
        }
    }

    /// Human-readable label used in denial messages.
    pub fn label(&self) -> &'static str {
        match self {
            Scope::Global => "Global",
            Scope::User => "User",
            Scope::ApiKey => "API key",
            Scope::Ip => "IP",
            Scope::General => "General",
        }
    }

    /// Label used in scope-specific `X-RateLimit-<Scope>-*` headers.
    pub fn header_label(&self) -> &'static str {
        match self {
            Scope::Global => "Global",
            Scope::User => "User",
            Scope::ApiKey => "ApiKey",
            Scope::Ip => "IP",
            Scope::General => "General",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::ApiKey => "api_key",
            Scope::Ip => "ip",
            Scope::General => "general",
        };
        f.write_str(name)
    }
}

/// An immutable limit bound to a scope.
///
/// `limit` and `window_ms` are both at least 1; the constructor is the only
/// way to build one. An optional message replaces the default denial text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitPolicy {
    scope: Scope,
    limit: u32,
    window_ms: u32,
    message: Option<Arc<str>>,
}

impl RateLimitPolicy {
    /// Create a policy, rejecting a zero limit or a zero window.
    pub fn new(scope: Scope, limit: u32, window_ms: u32) -> Result<Self> {
        if limit < 1 {
            return Err(QuotaError::config(format!(
                "{} policy limit must be at least 1",
                scope
            )));
        }
        if window_ms < 1 {
            return Err(QuotaError::config(format!(
                "{} policy window must be at least 1ms",
                scope
            )));
        }
        Ok(Self {
            scope,
            limit,
            window_ms,
            message: None,
        })
    }

    /// Report denials under this policy with `message` instead of the
    /// scope's default text. A blank message is ignored.
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        let message = message.as_ref().trim();
        self.message = (!message.is_empty()).then(|| Arc::from(message));
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_ms(&self) -> u32 {
        self.window_ms
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The same limit applied to a different scope.
    pub(crate) fn with_scope(self, scope: Scope) -> Self {
        Self { scope, ..self }
    }
}

/// Identity used to partition counters within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Global,
    User(String),
    ApiKey(String),
    Ip(String),
    /// Requester-derived or caller-named key, e.g. `user:u1` or
    /// `login_attempts:alice@example.com`
    General(String),
}

impl ScopeKey {
    pub fn scope(&self) -> Scope {
        match self {
            ScopeKey::Global => Scope::Global,
            ScopeKey::User(_) => Scope::User,
            ScopeKey::ApiKey(_) => Scope::ApiKey,
            ScopeKey::Ip(_) => Scope::Ip,
            ScopeKey::General(_) => Scope::General,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global => f.write_str("global"),
            ScopeKey::User(id) => write!(f, "user:{}", id),
            ScopeKey::ApiKey(id) => write!(f, "api_key:{}", id),
            ScopeKey::Ip(addr) => write!(f, "ip:{}", addr),
            ScopeKey::General(key) => write!(f, "general:{}", key),
        }
    }
}
