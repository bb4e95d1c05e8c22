//! API key authentication, tier permissions and rate limiting.

mod gate;

pub use gate::*;

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{ServerConfig, TierQuota};
use crate::db::{StoreError, Tier};

/// Allowlist entry granting every endpoint.
pub const WILDCARD: &str = "*";

/// Endpoints available to free-tier keys, relative to the versioned API root.
pub const FREE_TIER_ENDPOINTS: &[&str] = &[
    "/health",
    "/status",
    "/stats",
    "/categories",
    "/analytics/metrics",
    "/analytics/datasets/top",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    pub requests_per_hour: i64,
    pub requests_per_day: i64,
    pub allowed_endpoints: Vec<String>,
}

impl TierPolicy {
    fn new(quota: TierQuota, endpoints: &[&str]) -> Self {
        Self {
            requests_per_hour: quota.per_hour,
            requests_per_day: quota.per_day,
            allowed_endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Quotas and allowlists for every tier.
#[derive(Debug, Clone)]
pub struct TierPolicies {
    pub free: TierPolicy,
    pub pro: TierPolicy,
    pub enterprise: TierPolicy,
}

impl TierPolicies {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            free: TierPolicy::new(cfg.free, FREE_TIER_ENDPOINTS),
            pro: TierPolicy::new(cfg.pro, &[WILDCARD]),
            enterprise: TierPolicy::new(cfg.enterprise, &[WILDCARD]),
        }
    }

    pub fn get(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Limits, remaining quota and reset times for both windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub hour_limit: i64,
    pub hour_remaining: i64,
    pub hour_reset: DateTime<Utc>,
    pub day_limit: i64,
    pub day_remaining: i64,
    pub day_reset: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Set the `X-RateLimit-*` headers. Reset values are unix seconds.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let values = [
            ("x-ratelimit-limit-hour", self.hour_limit),
            ("x-ratelimit-remaining-hour", self.hour_remaining),
            ("x-ratelimit-reset-hour", self.hour_reset.timestamp()),
            ("x-ratelimit-limit-day", self.day_limit),
            ("x-ratelimit-remaining-day", self.day_remaining),
            ("x-ratelimit-reset-day", self.day_reset.timestamp()),
        ];
        for (name, value) in values {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    /// Never-issued, deactivated and malformed keys are indistinguishable.
    #[error("invalid or inactive API key")]
    InvalidKey,
    #[error("endpoint {endpoint} is not available on the {tier} tier")]
    EndpointNotAllowed { tier: Tier, endpoint: String },
    #[error("rate limit exceeded")]
    RateLimitExceeded(RateLimitInfo),
    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidKey => StatusCode::UNAUTHORIZED,
            AuthError::EndpointNotAllowed { .. } => StatusCode::FORBIDDEN,
            AuthError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidKey => "invalid_api_key",
            AuthError::EndpointNotAllowed { .. } => "endpoint_not_allowed",
            AuthError::RateLimitExceeded(_) => "rate_limit_exceeded",
            AuthError::Store(_) => "internal_error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AuthError::RateLimitExceeded(info) => {
                let body = json!({
                    "error": self.code(),
                    "message": self.to_string(),
                    "rate_limit": info,
                });
                let mut response = (status, Json(body)).into_response();
                info.apply_headers(response.headers_mut());
                response
            }
            AuthError::Store(e) => {
                tracing::error!("Auth store error: {}", e);
                let body = json!({ "error": self.code(), "message": "authentication unavailable" });
                (status, Json(body)).into_response()
            }
            _ => {
                let body = json!({ "error": self.code(), "message": self.to_string() });
                (status, Json(body)).into_response()
            }
        }
    }
}
