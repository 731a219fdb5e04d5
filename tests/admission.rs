use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use quotagate::config::QuotaConfig;
use quotagate::ratelimit::{
    AdmissionResult, Clock, CounterKey, CounterStore, EndpointPolicySet, EngineOptions, MemoryStore,
    MockClock, PolicyResolver, PresetRegistry, RateLimitPolicy, RateLimiter, RequestContext,
    ResolverOptions, RouteTable, Scope, ScopeKey, Sweeper,
};

const CONFIG: &str = r#"
ip:
  proxy_trust: real_ip
routes:
  - route: POST /auth/login
    policies:
      - scope: ip
        preset: per_minute_strict
      - scope: user
        preset: strict
  - route: POST /reviews
    policies:
      - scope: user
        limit: 5
        window_ms: 900000
      - scope: api_key
        limit: 2
        window_ms: 60000
      - scope: global
        limit: 1000
        window_ms: 60000
"#;

fn limiter_from(yaml: &str) -> (RateLimiter, Arc<MockClock>, Arc<MemoryStore>) {
    let config = QuotaConfig::from_yaml(yaml).unwrap();
    let clock = Arc::new(MockClock::from_millis(1_000_000));
    let store = Arc::new(config.memory_store());
    let limiter = config.build_limiter(store.clone(), clock.clone()).unwrap();
    (limiter, clock, store)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn login_denies_sixth_attempt_until_window_resets() {
    let (limiter, clock, _) = limiter_from(CONFIG);
    let ctx = RequestContext::new()
        .with_user("u1")
        .with_real_ip("198.51.100.4");

    for expected_remaining in (0..5).rev() {
        let result = limiter.admit("POST /auth/login", &ctx).await.unwrap();
        let headroom = result.headroom().unwrap();
        assert_eq!(headroom.remaining, expected_remaining);
    }

    let result = limiter.admit("POST /auth/login", &ctx).await.unwrap();
    let denial = result.denial().unwrap();
    assert_eq!(denial.scope, Scope::User);
    assert_eq!(denial.limit, 5);
    assert_eq!(denial.remaining, 0);

    let body = denial.to_body();
    assert_eq!(body.status_code, 429);
    assert_eq!(body.reason, "user_rate_limit");
    assert_eq!(body.reset_time, "1970-01-01T00:31:40.000Z");

    let headers = result.headers(clock.now());
    assert_eq!(header(&headers, "Retry-After"), Some("900"));
    assert_eq!(header(&headers, "X-RateLimit-User-Remaining"), Some("0"));

    // The per-minute IP window resets first, but the user window still binds.
    clock.advance_ms(60_001);
    let result = limiter.admit("POST /auth/login", &ctx).await.unwrap();
    assert_eq!(result.denial().unwrap().scope, Scope::User);

    clock.advance_ms(900_000);
    let result = limiter.admit("POST /auth/login", &ctx).await.unwrap();
    assert!(result.is_allowed());
}

#[tokio::test]
async fn api_key_denial_outranks_user_and_global() {
    let (limiter, _, store) = limiter_from(CONFIG);
    let ctx = RequestContext::new().with_user("u1").with_api_key("k1");

    assert!(limiter.admit("POST /reviews", &ctx).await.unwrap().is_allowed());
    assert!(limiter.admit("POST /reviews", &ctx).await.unwrap().is_allowed());

    let result = limiter.admit("POST /reviews", &ctx).await.unwrap();
    let denial = assert_err!(result.into_result());
    assert_eq!(denial.reason(), "api_key_rate_limit");

    // Denied requests still count against every applicable scope.
    let user = store
        .peek(
            &CounterKey::new(ScopeKey::User("u1".into()), 900_000),
            limiter.clock().now(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.count, 3);

    let stats = limiter.stats();
    assert_eq!(stats.admitted, 2);
    assert_eq!(stats.denied, 1);
}

#[tokio::test]
async fn unauthenticated_requests_skip_identity_scopes() {
    let (limiter, _, _) = limiter_from(CONFIG);
    let anonymous = RequestContext::new();

    for _ in 0..20 {
        let result = limiter.admit("POST /reviews", &anonymous).await.unwrap();
        let headroom = assert_ok!(result.into_result()).unwrap();
        assert_eq!(headroom.scope, Scope::Global);
    }
}

#[tokio::test]
async fn untrusted_forwarded_header_is_ignored() {
    let (limiter, _, _) = limiter_from(CONFIG);

    // Only X-Real-IP is trusted, so rotating X-Forwarded-For does not
    // escape the per-address limit.
    for i in 0..5 {
        let ctx = RequestContext::new()
            .with_peer("10.0.0.9:4433")
            .with_forwarded_for(format!("203.0.113.{}", i));
        assert!(limiter.admit("POST /auth/login", &ctx).await.unwrap().is_allowed());
    }

    let ctx = RequestContext::new()
        .with_peer("10.0.0.9:5000")
        .with_forwarded_for("203.0.113.200");
    let result = limiter.admit("POST /auth/login", &ctx).await.unwrap();
    assert_eq!(result.denial().unwrap().reason(), "ip_rate_limit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_limit() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::from_millis(0));

    let mut routes = RouteTable::new();
    routes
        .register(
            "POST /orders",
            EndpointPolicySet::new(vec![RateLimitPolicy::new(Scope::Global, 50, 60_000).unwrap()]),
        )
        .unwrap();
    let resolver = PolicyResolver::new(routes, ResolverOptions::default());
    let limiter = Arc::new(RateLimiter::new(
        store,
        resolver,
        clock,
        EngineOptions::default(),
    ));

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .admit("POST /orders", &RequestContext::new())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut allowed = 0;
    for task in tasks {
        if let AdmissionResult::Allowed(_) = task.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
}

#[tokio::test]
async fn sweeper_reclaims_only_stale_counters() {
    let (limiter, clock, store) = limiter_from(CONFIG);
    let shared: Arc<dyn CounterStore> = store.clone();
    let sweeper = Sweeper::new(shared, clock.clone(), Duration::from_secs(60)).unwrap();

    let ctx = RequestContext::new().with_user("u1").with_real_ip("198.51.100.4");
    limiter.admit("POST /auth/login", &ctx).await.unwrap();
    assert_eq!(store.counter_count(), 2);

    // Past two IP windows but well inside the user window.
    clock.advance_ms(120_001);
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    assert_eq!(store.counter_count(), 1);

    clock.advance_ms(1_800_000);
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    assert_eq!(store.counter_count(), 0);
}

#[tokio::test]
async fn reset_clears_a_single_bucket() {
    let (limiter, _, _) = limiter_from(CONFIG);
    let ctx = RequestContext::new().with_api_key("k1");

    limiter.admit("POST /reviews", &ctx).await.unwrap();
    limiter.admit("POST /reviews", &ctx).await.unwrap();
    assert!(!limiter.admit("POST /reviews", &ctx).await.unwrap().is_allowed());

    let removed = limiter.reset(&ScopeKey::ApiKey("k1".into())).await.unwrap();
    assert_eq!(removed, 1);
    assert!(limiter.admit("POST /reviews", &ctx).await.unwrap().is_allowed());
}

#[test]
fn builtin_presets_cover_documented_names() {
    let registry = PresetRegistry::builtin();
    for name in [
        "strict",
        "conservative",
        "standard",
        "generous",
        "per_minute_strict",
        "per_minute_standard",
        "per_minute_generous",
        "per_hour_strict",
        "per_hour_standard",
        "per_hour_generous",
    ] {
        assert!(registry.get(name).is_some(), "missing preset {}", name);
    }
}
