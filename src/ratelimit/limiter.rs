//! Admission engine.
//!
//! For each request the engine records a hit against every applicable
//! policy, then decides. Counting every declared scope on every attempt keeps
//! each counter accurate regardless of which scope ends up denying.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use chrono::{DateTime, Utc};

use super::clock::Clock;
use super::counter::WindowSnapshot;
use super::outcome::{AdmissionResult, Headroom, RateLimitExceeded};
use super::policy::{RateLimitPolicy, Scope, ScopeKey};
use super::presets::{LOGIN_ATTEMPTS, PASSWORD_RESET_ATTEMPTS};
use super::resolver::{PolicyResolver, RequestContext, ResolvedCheck, ResolvedPolicySet};
use super::store::{CounterStore, StoreError};
use crate::error::Result;

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// What to do with a policy whose counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Treat the policy as not exceeded.
    #[default]
    Open,
    /// Treat the policy as exceeded.
    Closed,
}

/// Engine behaviour that is independent of routes and policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub fail_mode: FailMode,
    pub store_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub admitted: u64,
    pub denied: u64,
    /// Store calls that failed or timed out
    pub store_errors: u64,
    /// Admissions granted only because a store failure was failed open
    pub fail_open_admissions: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    admitted: AtomicU64,
    denied: AtomicU64,
    store_errors: AtomicU64,
    fail_open_admissions: AtomicU64,
}

/// The rate limiter: resolves a request's policies and admits or denies it.
///
/// Shared across request handlers behind an `Arc`; the counter store is the
/// only mutable state it touches.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    resolver: PolicyResolver,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    stats: StatCounters,
}

/// Outcome of evaluating one check after its store call.
struct Evaluated {
    headroom: Headroom,
    exceeded: bool,
    failed_open: bool,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        resolver: PolicyResolver,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            options,
            stats: StatCounters::default(),
        }
    }

    /// Decide whether a request on `route` may proceed.
    ///
    /// Denial is a normal outcome; `Err` is only returned for store failures
    /// the fail mode does not cover.
    #[instrument(level = "trace", skip(self, ctx), fields(route = %route))]
    pub async fn admit(&self, route: &str, ctx: &RequestContext) -> Result<AdmissionResult> {
        let resolved = self.resolver.resolve(route, ctx);
        let now = self.clock.now();
        let result = self.check(&resolved, now).await?;

        if let AdmissionResult::Denied(denial) = &result {
            debug!(
                route = %route,
                reason = denial.reason(),
                limit = denial.limit,
                reset_at = %denial.reset_at,
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    /// Record a hit against every resolved check and decide.
    ///
    /// The denial reported is the first exceeded check in priority order.
    /// When nothing is exceeded, the check with the least remaining quota
    /// is reported.
    pub async fn check(
        &self,
        resolved: &ResolvedPolicySet,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult> {
        let outcomes = join_all(resolved.iter().map(|check| self.increment(check, now))).await;

        let mut denial: Option<RateLimitExceeded> = None;
        let mut tightest: Option<Headroom> = None;
        let mut failed_open = false;

        for (check, outcome) in resolved.iter().zip(outcomes) {
            let evaluated = self.evaluate(check, outcome, now)?;
            failed_open |= evaluated.failed_open;

            let headroom = evaluated.headroom;
            if evaluated.exceeded {
                denial.get_or_insert_with(|| {
                    RateLimitExceeded::new(headroom.scope, headroom.limit, headroom.reset_at)
                        .with_message(check.policy.message())
                });
            } else if tightest.map_or(true, |t| headroom.remaining < t.remaining) {
                tightest = Some(headroom);
            }
        }

        match denial {
            Some(denial) => {
                self.stats.denied.fetch_add(1, Ordering::Relaxed);
                Ok(AdmissionResult::Denied(denial))
            }
            None => {
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                if failed_open {
                    self.stats.fail_open_admissions.fetch_add(1, Ordering::Relaxed);
                }
                Ok(AdmissionResult::Allowed(tightest))
            }
        }
    }

    /// Report the tightest headroom for a request without consuming quota.
    pub async fn peek(&self, route: &str, ctx: &RequestContext) -> Result<Option<Headroom>> {
        let resolved = self.resolver.resolve(route, ctx);
        let now = self.clock.now();
        let timeout = self.options.store_timeout;

        let mut tightest: Option<Headroom> = None;
        for check in &resolved {
            let key = check.counter_key();
            let peeked = tokio::time::timeout(timeout, self.store.peek(&key, now))
                .await
                .unwrap_or(Err(StoreError::Timeout(timeout)));

            let policy = &check.policy;
            let headroom = match peeked {
                Ok(Some(snapshot)) => Headroom {
                    scope: policy.scope(),
                    limit: policy.limit(),
                    remaining: policy.limit().saturating_sub(snapshot.count),
                    reset_at: snapshot.reset_at(),
                },
                Ok(None) => Headroom {
                    scope: policy.scope(),
                    limit: policy.limit(),
                    remaining: policy.limit(),
                    reset_at: now + window_of(check),
                },
                Err(err) if err.is_recoverable() => {
                    self.record_store_error(check, &err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if tightest.map_or(true, |t| headroom.remaining < t.remaining) {
                tightest = Some(headroom);
            }
        }
        Ok(tightest)
    }

    /// Count a hit against a caller-named key, independent of any route.
    ///
    /// The key is namespaced by the caller, e.g. `login_attempts:<account>`,
    /// and is limited under the general scope.
    pub async fn admit_key(
        &self,
        key: impl Into<String>,
        policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult> {
        let check = ResolvedCheck {
            policy: policy.clone().with_scope(Scope::General),
            key: ScopeKey::General(key.into()),
        };
        let resolved = ResolvedPolicySet::from_checks(vec![check]);
        self.check(&resolved, self.clock.now()).await
    }

    /// Failed sign-in attempts for one account identifier.
    pub async fn check_login_attempts(&self, identifier: &str) -> Result<AdmissionResult> {
        let policy = LOGIN_ATTEMPTS.policy(Scope::General)?;
        self.admit_key(format!("login_attempts:{}", identifier), &policy)
            .await
    }

    /// Password reset requests for one email address.
    pub async fn check_password_reset_attempts(&self, email: &str) -> Result<AdmissionResult> {
        let policy = PASSWORD_RESET_ATTEMPTS.policy(Scope::General)?;
        self.admit_key(format!("password_reset:{}", email), &policy)
            .await
    }

    /// Clear every counter of one identity.
    pub async fn reset(&self, key: &ScopeKey) -> Result<usize> {
        Ok(self.store.reset(key).await?)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
            fail_open_admissions: self.stats.fail_open_admissions.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    async fn increment(
        &self,
        check: &ResolvedCheck,
        now: DateTime<Utc>,
    ) -> std::result::Result<WindowSnapshot, StoreError> {
        let key = check.counter_key();
        let timeout = self.options.store_timeout;

        trace!(key = %key, limit = check.policy.limit(), "Checking rate limit");

        tokio::time::timeout(timeout, self.store.increment(&key, now))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }

    fn evaluate(
        &self,
        check: &ResolvedCheck,
        outcome: std::result::Result<WindowSnapshot, StoreError>,
        now: DateTime<Utc>,
    ) -> Result<Evaluated> {
        let policy = &check.policy;
        let evaluated = match outcome {
            Ok(snapshot) => Evaluated {
                headroom: Headroom {
                    scope: policy.scope(),
                    limit: policy.limit(),
                    remaining: policy.limit().saturating_sub(snapshot.count),
                    reset_at: snapshot.reset_at(),
                },
                exceeded: snapshot.count > policy.limit(),
                failed_open: false,
            },
            Err(err) if err.is_recoverable() => {
                self.record_store_error(check, &err);
                let reset_at = now + window_of(check);
                match self.options.fail_mode {
                    FailMode::Open => Evaluated {
                        headroom: Headroom {
                            scope: policy.scope(),
                            limit: policy.limit(),
                            remaining: policy.limit(),
                            reset_at,
                        },
                        exceeded: false,
                        failed_open: true,
                    },
                    FailMode::Closed => Evaluated {
                        headroom: Headroom {
                            scope: policy.scope(),
                            limit: policy.limit(),
                            remaining: 0,
                            reset_at,
                        },
                        exceeded: true,
                        failed_open: false,
                    },
                }
            }
            Err(err) => return Err(err.into()),
        };
        Ok(evaluated)
    }

    fn record_store_error(&self, check: &ResolvedCheck, err: &StoreError) {
        self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            key = %check.key,
            error = %err,
            fail_mode = ?self.options.fail_mode,
            "Counter store call failed"
        );
    }
}

fn window_of(check: &ResolvedCheck) -> chrono::Duration {
    chrono::Duration::milliseconds(check.policy.window_ms() as i64)
}
