//! Derived metric types. Recomputed on demand, never stored.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Category reported when nothing is down.
pub const NO_PROBLEM_CATEGORY: &str = "None";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub window_hours: i64,
    pub total_datasets: i64,
    pub available_datasets: i64,
    pub unavailable_datasets: i64,
    pub checks_performed: i64,
    pub successful_checks: i64,
    pub avg_latency: f64,
    pub max_latency: f64,
    pub min_latency: f64,
    pub uptime_percentage: f64,
    pub reliability_score: f64,
    pub most_problematic_category: String,
    pub categories_count: i64,
}

impl SystemMetrics {
    /// All-zero metrics for an empty or unreadable window.
    pub fn empty(window_hours: i64) -> Self {
        Self {
            timestamp: Utc::now(),
            window_hours,
            total_datasets: 0,
            available_datasets: 0,
            unavailable_datasets: 0,
            checks_performed: 0,
            successful_checks: 0,
            avg_latency: 0.0,
            max_latency: 0.0,
            min_latency: 0.0,
            uptime_percentage: 0.0,
            reliability_score: 0.0,
            most_problematic_category: NO_PROBLEM_CATEGORY.to_string(),
            categories_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetrics {
    pub dataset_id: String,
    pub dataset_name: String,
    pub category: String,
    pub window_days: i64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub uptime_percentage: f64,
    pub avg_latency: f64,
    pub last_failure: Option<DateTime<Utc>>,
    /// Failures per day over the window.
    pub failure_frequency: f64,
    pub reliability_trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryAnalytics {
    pub category: String,
    pub total_datasets: i64,
    pub total_checks: i64,
    pub uptime_percentage: f64,
    pub avg_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    /// Start of the bucket.
    pub timestamp: DateTime<Utc>,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub uptime_percentage: f64,
    pub avg_latency: f64,
}

/// One entry of a top-performing or problematic ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDataset {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub total_checks: i64,
    pub failed_checks: i64,
    pub uptime_percentage: f64,
    pub failure_rate: f64,
    pub avg_latency: f64,
}
