//! Rate limiting logic and state management.

mod clock;
mod counter;
mod limiter;
mod outcome;
mod policy;
mod presets;
mod resolver;
mod store;
mod sweeper;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterKey, WindowAlignment, WindowCounter, WindowSnapshot};
pub use limiter::{EngineOptions, EngineStats, FailMode, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use outcome::{
    iso8601, AdmissionResult, Headroom, RateLimitExceeded, TooManyRequestsBody, TOO_MANY_REQUESTS,
};
pub use policy::{RateLimitPolicy, Scope, ScopeKey};
pub use presets::{
    Preset, PresetRegistry, BUILTIN_PRESETS, LOGIN_ATTEMPTS, PASSWORD_RESET_ATTEMPTS,
};
pub use resolver::{
    normalize_ip, EndpointPolicySet, PolicyResolver, ProxyTrust, RequestContext, ResolvedCheck,
    ResolvedPolicySet, ResolverOptions, RouteTable, UNKNOWN_IP,
};
pub use store::{CounterStore, MemoryStore, StoreError};
pub use sweeper::{Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
