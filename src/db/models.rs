//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HTTP method used to probe a dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    #[default]
    Head,
    Get,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Head => "HEAD",
            ProbeMethod::Get => "GET",
        }
    }
}

impl FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEAD" => Ok(ProbeMethod::Head),
            "GET" => Ok(ProbeMethod::Get),
            other => Err(format!("unsupported probe method: {}", other)),
        }
    }
}

/// Longest per-request timeout a dataset may declare.
pub const MAX_TIMEOUT_SECS: f64 = 300.0;

fn default_timeout() -> f64 {
    6.0
}

/// A monitored dataset as declared in the sources configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub category: String,
    pub url: String,
    #[serde(default)]
    pub method: ProbeMethod,
    /// Probe timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Dataset {
    pub fn new(id: &str, name: &str, category: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            url: url.to_string(),
            method: ProbeMethod::Head,
            timeout: default_timeout(),
            description: None,
        }
    }

    /// Set the timeout, using the default for non-positive or non-finite
    /// values and capping at `MAX_TIMEOUT_SECS`.
    pub fn set_timeout(&mut self, secs: f64) {
        self.timeout = if secs.is_finite() && secs > 0.0 {
            secs.min(MAX_TIMEOUT_SECS)
        } else {
            default_timeout()
        };
    }

    /// Timeout as a duration. Out-of-range values are normalized as in `set_timeout`.
    pub fn timeout_duration(&self) -> std::time::Duration {
        let secs = if self.timeout.is_finite() && self.timeout > 0.0 {
            self.timeout.min(MAX_TIMEOUT_SECS)
        } else {
            default_timeout()
        };
        std::time::Duration::from_secs_f64(secs)
    }
}

/// A dataset row from the registry table.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredDataset {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Availability of a dataset at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, CheckStatus::Up)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "down" => Ok(CheckStatus::Down),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Outcome of one probe of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub url: String,
    pub status: CheckStatus,
    pub http_code: Option<u16>,
    pub latency_ms: Option<f64>,
    /// Failure-kind tag, set for every `down` result.
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn up(dataset: &Dataset, http_code: u16, latency_ms: f64, checked_at: DateTime<Utc>) -> Self {
        Self {
            dataset_id: dataset.id.clone(),
            name: dataset.name.clone(),
            category: dataset.category.clone(),
            url: dataset.url.clone(),
            status: CheckStatus::Up,
            http_code: Some(http_code),
            latency_ms: Some(latency_ms),
            error: None,
            checked_at,
        }
    }

    pub fn down(
        dataset: &Dataset,
        http_code: Option<u16>,
        latency_ms: Option<f64>,
        error: &str,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset_id: dataset.id.clone(),
            name: dataset.name.clone(),
            category: dataset.category.clone(),
            url: dataset.url.clone(),
            status: CheckStatus::Down,
            http_code,
            latency_ms,
            error: Some(error.to_string()),
            checked_at,
        }
    }
}

/// Aggregate availability over a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AvailabilityStats {
    pub total_datasets: i64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub avg_latency: Option<f64>,
    pub by_category: Vec<CategoryStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: String,
    pub dataset_count: i64,
    pub check_count: i64,
    pub successful_count: i64,
    pub avg_latency: Option<f64>,
}

/// Window aggregates over every check, used by system metrics.
#[derive(Debug, Clone, Default)]
pub struct CheckAggregate {
    pub total_datasets: i64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub avg_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub min_latency: Option<f64>,
}

/// Per-dataset counts over a window.
#[derive(Debug, Clone)]
pub struct DatasetRollup {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub avg_latency: Option<f64>,
}

/// A lightweight sample used for time bucketing.
#[derive(Debug, Clone)]
pub struct CheckSample {
    pub checked_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub latency_ms: Option<f64>,
}

// --- API keys ---

/// API key permission and quota class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// A stored API key. Holds only the hash of the secret.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub key_id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub name: String,
    pub description: String,
    pub user_email: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub rate_limit_per_hour: i64,
    pub rate_limit_per_day: i64,
    pub allowed_endpoints: Vec<String>,
}

/// One gated API call.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub key_id: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    /// Whether the call passed the gate and counts against the quota.
    pub admitted: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Usage counts in the trailing windows, as read by the rate limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageWindowCounts {
    pub hour_count: i64,
    pub day_count: i64,
    pub oldest_in_hour: Option<DateTime<Utc>>,
    pub oldest_in_day: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCount {
    pub endpoint: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCodeCount {
    pub status_code: Option<u16>,
    pub count: i64,
}

/// Usage statistics for one key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyUsageStats {
    pub total_requests: i64,
    pub avg_response_time: Option<f64>,
    pub first_request: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
    pub top_endpoints: Vec<EndpointCount>,
    pub status_codes: Vec<StatusCodeCount>,
}
