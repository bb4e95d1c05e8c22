//! The gate every versioned API request passes through.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{AuthError, RateLimitInfo, TierPolicies, WILDCARD};
use crate::analytics::hours_ago;
use crate::db::{ApiKey, KeyUsageStats, Store, Tier, UsageRecord, UsageWindowCounts};

const KEY_ID_PREFIX: &str = "ak_";
const SECRET_PREFIX: &str = "sk_";

/// Caller details recorded with each usage entry.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// A newly issued key. The secret is only ever available here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    #[serde(flatten)]
    pub key: ApiKey,
    pub secret: String,
}

/// An admitted request, to be completed once the response is known.
#[derive(Debug, Clone)]
pub struct GateGrant {
    pub key: ApiKey,
    pub usage_id: i64,
    pub rate_limit: RateLimitInfo,
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Validates keys, enforces tier allowlists and quotas, and logs usage.
#[derive(Clone)]
pub struct ApiGate {
    store: Store,
    policies: TierPolicies,
}

impl ApiGate {
    pub fn new(store: Store, policies: TierPolicies) -> Self {
        Self { store, policies }
    }

    /// Issue a key. Only the hash of the secret is stored.
    pub fn generate_key(
        &self,
        name: &str,
        user_email: &str,
        tier: Tier,
        description: &str,
    ) -> Result<IssuedKey, AuthError> {
        let key_id = format!("{}{}", KEY_ID_PREFIX, random_hex(16));
        let secret = format!("{}{}", SECRET_PREFIX, random_hex(32));
        let policy = self.policies.get(tier);

        let key = ApiKey {
            key_id,
            key_hash: hash_secret(&secret),
            name: name.to_string(),
            description: description.to_string(),
            user_email: user_email.to_string(),
            tier,
            created_at: Utc::now(),
            last_used: None,
            is_active: true,
            rate_limit_per_hour: policy.requests_per_hour,
            rate_limit_per_day: policy.requests_per_day,
            allowed_endpoints: policy.allowed_endpoints.clone(),
        };
        self.store.insert_api_key(&key)?;

        tracing::info!(key_id = %key.key_id, tier = %tier, "Generated API key");
        Ok(IssuedKey { key, secret })
    }

    /// Resolve a presented secret to its active key and stamp `last_used`.
    pub fn validate(&self, secret: &str) -> Result<ApiKey, AuthError> {
        self.validate_at(secret, Utc::now())
    }

    fn validate_at(&self, secret: &str, now: DateTime<Utc>) -> Result<ApiKey, AuthError> {
        if !secret.starts_with(SECRET_PREFIX) {
            return Err(AuthError::InvalidKey);
        }
        self.store
            .authenticate_key_hash(&hash_secret(secret), now)?
            .ok_or(AuthError::InvalidKey)
    }

    /// Validate without enforcing: for endpoints where a key is optional.
    pub fn identify(&self, secret: Option<&str>) -> Option<ApiKey> {
        self.validate(secret?).ok()
    }

    /// Whether `key` may call `endpoint`.
    pub fn check_endpoint(key: &ApiKey, endpoint: &str) -> Result<(), AuthError> {
        let allowed = key
            .allowed_endpoints
            .iter()
            .any(|e| e == WILDCARD || e == endpoint);
        if allowed {
            Ok(())
        } else {
            Err(AuthError::EndpointNotAllowed {
                tier: key.tier,
                endpoint: endpoint.to_string(),
            })
        }
    }

    /// Authenticate, authorize and rate-limit one request.
    pub fn authorize(
        &self,
        secret: Option<&str>,
        endpoint: &str,
        method: &str,
        meta: &RequestMeta,
    ) -> Result<GateGrant, AuthError> {
        self.authorize_at(secret, endpoint, method, meta, Utc::now())
    }

    /// As [`authorize`](Self::authorize) at an explicit time.
    ///
    /// Every call appends one usage record. Only admitted records count
    /// against the quota, and counting and appending happen atomically.
    pub fn authorize_at(
        &self,
        secret: Option<&str>,
        endpoint: &str,
        method: &str,
        meta: &RequestMeta,
        now: DateTime<Utc>,
    ) -> Result<GateGrant, AuthError> {
        self.admit(secret, endpoint, method, meta, now, true)
    }

    /// Authenticate and rate-limit a request a key makes about itself.
    /// The tier allowlist does not apply; quotas and usage logging do.
    pub fn authorize_owner(
        &self,
        secret: Option<&str>,
        endpoint: &str,
        method: &str,
        meta: &RequestMeta,
    ) -> Result<GateGrant, AuthError> {
        self.admit(secret, endpoint, method, meta, Utc::now(), false)
    }

    fn admit(
        &self,
        secret: Option<&str>,
        endpoint: &str,
        method: &str,
        meta: &RequestMeta,
        now: DateTime<Utc>,
        check_allowlist: bool,
    ) -> Result<GateGrant, AuthError> {
        let denied = |key_id: Option<&str>, status: u16| UsageRecord {
            key_id: key_id.map(str::to_string),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            timestamp: now,
            response_time_ms: None,
            status_code: Some(status),
            admitted: false,
            user_agent: meta.user_agent.clone(),
            ip_address: meta.ip_address.clone(),
        };

        let key = match secret.map(|s| self.validate_at(s, now)) {
            Some(Ok(key)) => key,
            Some(Err(AuthError::Store(e))) => return Err(AuthError::Store(e)),
            Some(Err(_)) | None => {
                self.log_denial(&denied(None, 401));
                tracing::debug!(endpoint, "Rejected request: invalid API key");
                return Err(AuthError::InvalidKey);
            }
        };

        if check_allowlist {
            if let Err(e) = Self::check_endpoint(&key, endpoint) {
                self.log_denial(&denied(Some(&key.key_id), 403));
                tracing::debug!(key_id = %key.key_id, endpoint, "Rejected request: endpoint not allowed");
                return Err(e);
            }
        }

        let mut admitted = false;
        let (counts, usage_id) = self.store.count_and_record_usage(&key.key_id, now, |counts| {
            admitted = counts.hour_count < key.rate_limit_per_hour && counts.day_count < key.rate_limit_per_day;
            let mut record = denied(Some(&key.key_id), 429);
            if admitted {
                record.status_code = None;
                record.admitted = true;
            }
            record
        })?;

        let rate_limit = rate_limit_info(&key, &counts, admitted, now);
        if !admitted {
            tracing::debug!(key_id = %key.key_id, endpoint, "Rejected request: rate limit exceeded");
            return Err(AuthError::RateLimitExceeded(rate_limit));
        }

        Ok(GateGrant {
            key,
            usage_id,
            rate_limit,
        })
    }

    fn log_denial(&self, record: &UsageRecord) {
        if let Err(e) = self.store.insert_usage(record) {
            tracing::warn!("Failed to log denied request: {}", e);
        }
    }

    /// Record the outcome of an admitted request.
    pub fn complete(&self, usage_id: i64, status_code: u16, response_time_ms: f64) -> Result<(), AuthError> {
        Ok(self.store.complete_usage(usage_id, status_code, response_time_ms)?)
    }

    /// Soft-delete a key. Returns false if it was unknown or already inactive.
    pub fn deactivate_key(&self, key_id: &str) -> Result<bool, AuthError> {
        let changed = self.store.deactivate_api_key(key_id)?;
        if changed {
            tracing::info!(key_id, "Deactivated API key");
        }
        Ok(changed)
    }

    /// Keys issued to `user_email`. Hashes are never serialized.
    pub fn list_keys(&self, user_email: &str) -> Result<Vec<ApiKey>, AuthError> {
        Ok(self.store.list_api_keys(user_email)?)
    }

    /// Current quota standing of `key` without consuming any.
    pub fn quota(&self, key: &ApiKey) -> Result<RateLimitInfo, AuthError> {
        let now = Utc::now();
        let counts = self.store.usage_window_counts(&key.key_id, now)?;
        Ok(rate_limit_info(key, &counts, false, now))
    }

    /// Usage statistics for one key over the trailing `hours`.
    pub fn key_stats(&self, key_id: &str, hours: i64) -> Result<KeyUsageStats, AuthError> {
        Ok(self.store.key_usage_stats(key_id, hours_ago(hours))?)
    }
}

fn rate_limit_info(key: &ApiKey, counts: &UsageWindowCounts, admitted: bool, now: DateTime<Utc>) -> RateLimitInfo {
    // An admitted request consumed one unit of each window.
    let used = |count: i64| if admitted { count + 1 } else { count };
    RateLimitInfo {
        hour_limit: key.rate_limit_per_hour,
        hour_remaining: (key.rate_limit_per_hour - used(counts.hour_count)).max(0),
        hour_reset: counts.oldest_in_hour.unwrap_or(now) + ChronoDuration::hours(1),
        day_limit: key.rate_limit_per_day,
        day_remaining: (key.rate_limit_per_day - used(counts.day_count)).max(0),
        day_reset: counts.oldest_in_day.unwrap_or(now) + ChronoDuration::days(1),
    }
}
