//! Admission outcomes and their boundary representation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::policy::Scope;

/// Status code used for rate-limited responses.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Render an instant as an ISO-8601 UTC timestamp with millisecond precision.
pub fn iso8601(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Quota left under one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headroom {
    pub scope: Scope,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// A request was rejected because a scope's quota is used up.
///
/// One type covers every denial kind; `scope` is the discriminant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", describe(.scope, .message, .reset_at))]
pub struct RateLimitExceeded {
    pub scope: Scope,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Replaces the scope's default message when set
    pub message: Option<Arc<str>>,
}

fn describe(scope: &Scope, message: &Option<Arc<str>>, reset_at: &DateTime<Utc>) -> String {
    match (message, scope) {
        (Some(message), _) => message.to_string(),
        (None, Scope::General) => "Rate limit exceeded".to_string(),
        (None, scope) => format!(
            "{} rate limit exceeded. Try again after {}",
            scope.label(),
            iso8601(reset_at)
        ),
    }
}

impl RateLimitExceeded {
    pub fn new(scope: Scope, limit: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            limit,
            remaining: 0,
            reset_at,
            message: None,
        }
    }

    pub fn with_message(mut self, message: Option<&str>) -> Self {
        self.message = message.map(Arc::from);
        self
    }

    /// Machine-readable reason, e.g. `api_key_rate_limit`.
    pub fn reason(&self) -> &'static str {
        self.scope.reason()
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000)
    }

    /// JSON body for a "too many requests" response.
    pub fn to_body(&self) -> TooManyRequestsBody {
        TooManyRequestsBody {
            status_code: TOO_MANY_REQUESTS,
            error: "Too Many Requests".to_string(),
            message: self.to_string(),
            reason: self.reason().to_string(),
            limit: self.limit,
            remaining: self.remaining,
            reset_time: iso8601(&self.reset_at),
        }
    }
}

/// Structured payload of a rate-limited response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TooManyRequestsBody {
    pub status_code: u16,
    pub error: String,
    pub message: String,
    pub reason: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: String,
}

/// The allow/deny decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    /// Admitted. Carries the tightest headroom among the applied policies,
    /// or `None` when no policy applied.
    Allowed(Option<Headroom>),
    /// Rejected by the highest-priority exceeded policy.
    Denied(RateLimitExceeded),
}

impl AdmissionResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionResult::Allowed(_))
    }

    pub fn headroom(&self) -> Option<&Headroom> {
        match self {
            AdmissionResult::Allowed(headroom) => headroom.as_ref(),
            AdmissionResult::Denied(_) => None,
        }
    }

    pub fn denial(&self) -> Option<&RateLimitExceeded> {
        match self {
            AdmissionResult::Denied(denial) => Some(denial),
            AdmissionResult::Allowed(_) => None,
        }
    }

    /// Convert to a `Result` so callers can bail out with `?`.
    pub fn into_result(self) -> std::result::Result<Option<Headroom>, RateLimitExceeded> {
        match self {
            AdmissionResult::Allowed(headroom) => Ok(headroom),
            AdmissionResult::Denied(denial) => Err(denial),
        }
    }

    /// Informational rate limit headers for the response.
    ///
    /// Emits the generic `X-RateLimit-*` triple, a scope-specific copy, and
    /// `Retry-After` on denial.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let (scope, limit, remaining, reset_at) = match self {
            AdmissionResult::Allowed(None) => return Vec::new(),
            AdmissionResult::Allowed(Some(h)) => (h.scope, h.limit, h.remaining, h.reset_at),
            AdmissionResult::Denied(d) => (d.scope, d.limit, d.remaining, d.reset_at),
        };

        let reset = reset_at.timestamp().to_string();
        let mut headers = Vec::with_capacity(7);
        for prefix in ["X-RateLimit".to_string(), format!("X-RateLimit-{}", scope.header_label())] {
            headers.push((format!("{}-Limit", prefix), limit.to_string()));
            headers.push((format!("{}-Remaining", prefix), remaining.to_string()));
            headers.push((format!("{}-Reset", prefix), reset.clone()));
        }
        if let AdmissionResult::Denied(denial) = self {
            headers.push(("Retry-After".to_string(), denial.retry_after_secs(now).to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_denial_message_embeds_iso_reset() {
        let denial = RateLimitExceeded::new(Scope::User, 5, at(900_000));
        assert_eq!(
            denial.to_string(),
            "User rate limit exceeded. Try again after 1970-01-01T00:15:00.000Z"
        );

        let denial = RateLimitExceeded::new(Scope::ApiKey, 5, at(0));
        assert!(denial.to_string().starts_with("API key rate limit exceeded"));
    }

    #[test]
    fn test_denial_reasons() {
        let reasons: Vec<&str> = [Scope::User, Scope::ApiKey, Scope::Ip, Scope::Global, Scope::General]
            .iter()
            .map(|scope| RateLimitExceeded::new(*scope, 1, at(0)).reason())
            .collect();
        assert_eq!(
            reasons,
            vec![
                "user_rate_limit",
                "api_key_rate_limit",
                "ip_rate_limit",
                "global_rate_limit",
                "rate_limit"
            ]
        );
    }

    #[test]
    fn test_general_denial_message() {
        let denial = RateLimitExceeded::new(Scope::General, 100, at(0));
        assert_eq!(denial.to_string(), "Rate limit exceeded");
    }

    #[test]
    fn test_custom_message_flows_into_body() {
        let denial = RateLimitExceeded::new(Scope::User, 3, at(60_000))
            .with_message(Some("Too many reviews posted, try again later"));
        let body = denial.to_body();

        assert_eq!(body.message, "Too many reviews posted, try again later");
        assert_eq!(body.reason, "user_rate_limit");
        assert_eq!(body.reset_time, "1970-01-01T00:01:00.000Z");
    }

    #[test]
    fn test_body_serialization() {
        let denial = RateLimitExceeded::new(Scope::Ip, 60, at(60_000));
        let json = serde_json::to_value(denial.to_body()).unwrap();

        assert_eq!(json["statusCode"], 429);
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["reason"], "ip_rate_limit");
        assert_eq!(json["limit"], 60);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["resetTime"], "1970-01-01T00:01:00.000Z");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let denial = RateLimitExceeded::new(Scope::Global, 1, at(10_000));
        assert_eq!(denial.retry_after_secs(at(8_500)), 2);
        assert_eq!(denial.retry_after_secs(at(9_000)), 1);
        assert_eq!(denial.retry_after_secs(at(12_000)), 0);
    }

    #[test]
    fn test_allowed_headers() {
        let result = AdmissionResult::Allowed(Some(Headroom {
            scope: Scope::User,
            limit: 100,
            remaining: 42,
            reset_at: at(5_000),
        }));
        let headers = result.headers(at(0));

        assert_eq!(header(&headers, "X-RateLimit-Limit"), Some("100"));
        assert_eq!(header(&headers, "X-RateLimit-Remaining"), Some("42"));
        assert_eq!(header(&headers, "X-RateLimit-Reset"), Some("5"));
        assert_eq!(header(&headers, "X-RateLimit-User-Remaining"), Some("42"));
        assert_eq!(header(&headers, "Retry-After"), None);
    }

    #[test]
    fn test_denied_headers_include_retry_after() {
        let result = AdmissionResult::Denied(RateLimitExceeded::new(Scope::ApiKey, 10, at(30_000)));
        let headers = result.headers(at(0));

        assert_eq!(header(&headers, "X-RateLimit-ApiKey-Limit"), Some("10"));
        assert_eq!(header(&headers, "X-RateLimit-Remaining"), Some("0"));
        assert_eq!(header(&headers, "Retry-After"), Some("30"));
    }

    #[test]
    fn test_unlimited_admission_has_no_headers() {
        assert!(AdmissionResult::Allowed(None).headers(at(0)).is_empty());
    }

    #[test]
    fn test_into_result() {
        let denial = RateLimitExceeded::new(Scope::User, 5, at(0));
        assert_eq!(AdmissionResult::Denied(denial.clone()).into_result(), Err(denial));
        assert_eq!(AdmissionResult::Allowed(None).into_result(), Ok(None));
    }
}
