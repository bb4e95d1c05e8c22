//! Analytics engine: read-only derived metrics over the status history.
//!
//! Every public method degrades to an empty or zero-valued result when the
//! store fails. Metrics are an observability surface and must stay available
//! when storage is not.

mod models;

pub use models::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::db::{CheckStatus, DatasetRollup, Store, StoreError};

/// Minimum checks in the window before a dataset is ranked.
pub const MIN_RANKING_CHECKS: i64 = 3;
/// Minimum records before a trend is computed.
pub const MIN_TREND_RECORDS: usize = 6;
/// Uptime difference, in percentage points, that counts as a trend.
const TREND_THRESHOLD: f64 = 10.0;
/// Latency penalty ceiling, in score points.
const MAX_LATENCY_PENALTY: f64 = 20.0;
/// Longest look-back any query accepts.
pub const MAX_WINDOW_HOURS: i64 = 24 * 366;

/// Clamp a requested look-back to `[1, MAX_WINDOW_HOURS]`.
pub fn clamp_hours(hours: i64) -> i64 {
    hours.clamp(1, MAX_WINDOW_HOURS)
}

/// Clamp a requested look-back in days to the same bounds.
pub fn clamp_days(days: i64) -> i64 {
    days.clamp(1, MAX_WINDOW_HOURS / 24)
}

/// Start of a trailing window of `hours`, clamped.
pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(clamp_hours(hours))
}

/// Uptime in percent, 0 when there were no checks.
pub fn uptime_percentage(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        successful as f64 / total as f64 * 100.0
    }
}

/// Uptime penalized by average latency: one point per second, at most 20.
pub fn reliability_score(uptime: f64, avg_latency_ms: f64) -> f64 {
    let penalty = (avg_latency_ms.max(0.0) / 1000.0).min(MAX_LATENCY_PENALTY);
    (uptime - penalty).max(0.0)
}

/// Compare the recent and older halves of a most-recent-first status list.
pub fn reliability_trend(statuses: &[CheckStatus]) -> Trend {
    if statuses.len() < MIN_TREND_RECORDS {
        return Trend::Stable;
    }

    let (recent, older) = statuses.split_at(statuses.len() / 2);
    let up = |half: &[CheckStatus]| half.iter().filter(|s| s.is_up()).count() as i64;
    let difference =
        uptime_percentage(up(recent), recent.len() as i64) - uptime_percentage(up(older), older.len() as i64);

    if difference > TREND_THRESHOLD {
        Trend::Improving
    } else if difference < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Truncate a timestamp to the start of its window, aligned to the epoch.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    if window_seconds <= 0 {
        return dt;
    }
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Store,
}

impl AnalyticsEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn or_default<T>(what: &str, result: Result<T, StoreError>, default: impl FnOnce() -> T) -> T {
        result.unwrap_or_else(|e| {
            tracing::warn!("Analytics: {} unavailable: {}", what, e);
            default()
        })
    }

    /// System-wide metrics over the trailing `hours`.
    pub fn system_metrics(&self, hours: i64) -> SystemMetrics {
        let hours = clamp_hours(hours);
        Self::or_default("system metrics", self.try_system_metrics(hours), || {
            SystemMetrics::empty(hours)
        })
    }

    fn try_system_metrics(&self, hours: i64) -> Result<SystemMetrics, StoreError> {
        let since = hours_ago(hours);
        let agg = self.store.check_aggregate(since)?;
        let latest = self.store.latest_since(since)?;

        let available = latest.iter().filter(|r| r.status.is_up()).count() as i64;
        let unavailable = latest.len() as i64 - available;

        let categories: BTreeSet<&str> = latest
            .iter()
            .map(|r| r.category.as_str())
            .filter(|c| !c.is_empty())
            .collect();

        let mut down_by_category: BTreeMap<&str, i64> = BTreeMap::new();
        for r in latest.iter().filter(|r| r.status == CheckStatus::Down) {
            *down_by_category.entry(r.category.as_str()).or_default() += 1;
        }
        // Alphabetical iteration with a strict comparison keeps the first of any tie.
        let mut most_problematic: Option<(&str, i64)> = None;
        for (category, count) in down_by_category {
            if most_problematic.map_or(true, |(_, best)| count > best) {
                most_problematic = Some((category, count));
            }
        }

        let uptime = uptime_percentage(agg.successful_checks, agg.total_checks);
        let avg_latency = agg.avg_latency.unwrap_or(0.0);
        let reliability = if agg.total_checks > 0 {
            reliability_score(uptime, avg_latency)
        } else {
            0.0
        };

        Ok(SystemMetrics {
            timestamp: Utc::now(),
            window_hours: hours,
            total_datasets: agg.total_datasets,
            available_datasets: available,
            unavailable_datasets: unavailable,
            checks_performed: agg.total_checks,
            successful_checks: agg.successful_checks,
            avg_latency: round2(avg_latency),
            max_latency: round2(agg.max_latency.unwrap_or(0.0)),
            min_latency: round2(agg.min_latency.unwrap_or(0.0)),
            uptime_percentage: round2(uptime),
            reliability_score: round2(reliability),
            most_problematic_category: most_problematic
                .map(|(c, _)| c.to_string())
                .unwrap_or_else(|| NO_PROBLEM_CATEGORY.to_string()),
            categories_count: categories.len() as i64,
        })
    }

    /// Rollup for one dataset over the trailing `days`. `None` if it has no checks.
    pub fn dataset_metrics(&self, dataset_id: &str, days: i64) -> Option<DatasetMetrics> {
        let days = clamp_days(days);
        Self::or_default("dataset metrics", self.try_dataset_metrics(dataset_id, days), || None)
    }

    fn try_dataset_metrics(&self, dataset_id: &str, days: i64) -> Result<Option<DatasetMetrics>, StoreError> {
        let since = Utc::now() - ChronoDuration::days(days);
        let records = self.store.history(dataset_id, since)?;
        let Some(newest) = records.first() else {
            return Ok(None);
        };

        let total = records.len() as i64;
        let successful = records.iter().filter(|r| r.status.is_up()).count() as i64;
        let failed = total - successful;
        let statuses: Vec<CheckStatus> = records.iter().map(|r| r.status).collect();

        Ok(Some(DatasetMetrics {
            dataset_id: dataset_id.to_string(),
            dataset_name: newest.name.clone(),
            category: newest.category.clone(),
            window_days: days,
            total_checks: total,
            successful_checks: successful,
            failed_checks: failed,
            uptime_percentage: round2(uptime_percentage(successful, total)),
            avg_latency: round2(mean(records.iter().filter_map(|r| r.latency_ms)).unwrap_or(0.0)),
            last_failure: records
                .iter()
                .find(|r| r.status == CheckStatus::Down)
                .map(|r| r.checked_at),
            failure_frequency: if days > 0 { round2(failed as f64 / days as f64) } else { 0.0 },
            reliability_trend: reliability_trend(&statuses),
        }))
    }

    /// Per-category rollup, most datasets first.
    pub fn category_analytics(&self, hours: i64) -> Vec<CategoryAnalytics> {
        Self::or_default("category analytics", self.try_category_analytics(hours), Vec::new)
    }

    fn try_category_analytics(&self, hours: i64) -> Result<Vec<CategoryAnalytics>, StoreError> {
        let since = hours_ago(hours);
        let stats = self.store.availability_stats(since)?;

        let mut categories: Vec<CategoryAnalytics> = stats
            .by_category
            .into_iter()
            .filter(|c| !c.category.is_empty())
            .map(|c| CategoryAnalytics {
                uptime_percentage: round2(uptime_percentage(c.successful_count, c.check_count)),
                avg_latency: round2(c.avg_latency.unwrap_or(0.0)),
                total_datasets: c.dataset_count,
                total_checks: c.check_count,
                category: c.category,
            })
            .collect();

        categories.sort_by(|a, b| {
            b.total_datasets
                .cmp(&a.total_datasets)
                .then_with(|| a.category.cmp(&b.category))
        });
        Ok(categories)
    }

    /// Uptime and latency in time buckets of `bucket_minutes` (0 means hourly).
    pub fn timeline(&self, hours: i64, bucket_minutes: i64) -> Vec<TimelinePoint> {
        Self::or_default("timeline", self.try_timeline(hours, bucket_minutes), Vec::new)
    }

    fn try_timeline(&self, hours: i64, bucket_minutes: i64) -> Result<Vec<TimelinePoint>, StoreError> {
        let bucket_seconds = if bucket_minutes > 0 {
            bucket_minutes.min(MAX_WINDOW_HOURS * 60) * 60
        } else {
            3600
        };
        let since = hours_ago(hours);
        let samples = self.store.samples_since(since)?;

        #[derive(Default)]
        struct Bucket {
            total: i64,
            successful: i64,
            latency_sum: f64,
            latency_count: usize,
        }

        let mut buckets: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();
        for sample in samples {
            let bucket = buckets
                .entry(truncate_to_window(sample.checked_at, bucket_seconds))
                .or_default();
            bucket.total += 1;
            if sample.status.is_up() {
                bucket.successful += 1;
            }
            if let Some(latency) = sample.latency_ms {
                bucket.latency_sum += latency;
                bucket.latency_count += 1;
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(timestamp, b)| TimelinePoint {
                timestamp,
                total_checks: b.total,
                successful_checks: b.successful,
                uptime_percentage: round2(uptime_percentage(b.successful, b.total)),
                avg_latency: if b.latency_count > 0 {
                    round2(b.latency_sum / b.latency_count as f64)
                } else {
                    0.0
                },
            })
            .collect())
    }

    /// Highest uptime first; lower latency wins ties.
    pub fn top_performing(&self, limit: usize, hours: i64) -> Vec<RankedDataset> {
        Self::or_default(
            "top datasets",
            self.ranked(hours, |a, b| {
                uptime_of(b)
                    .total_cmp(&uptime_of(a))
                    .then_with(|| latency_of(a).total_cmp(&latency_of(b)))
            }),
            Vec::new,
        )
        .into_iter()
        .take(limit)
        .collect()
    }

    /// Highest failure rate first; higher latency wins ties.
    pub fn problematic(&self, limit: usize, hours: i64) -> Vec<RankedDataset> {
        Self::or_default(
            "problematic datasets",
            self.ranked(hours, |a, b| {
                uptime_of(a)
                    .total_cmp(&uptime_of(b))
                    .then_with(|| latency_of(b).total_cmp(&latency_of(a)))
            }),
            Vec::new,
        )
        .into_iter()
        .take(limit)
        .collect()
    }

    fn ranked<F>(&self, hours: i64, order: F) -> Result<Vec<RankedDataset>, StoreError>
    where
        F: Fn(&DatasetRollup, &DatasetRollup) -> Ordering,
    {
        let since = hours_ago(hours);
        let mut rollups: Vec<DatasetRollup> = self
            .store
            .dataset_rollups(since)?
            .into_iter()
            .filter(|r| r.total_checks >= MIN_RANKING_CHECKS)
            .collect();
        rollups.sort_by(|a, b| order(a, b).then_with(|| a.dataset_id.cmp(&b.dataset_id)));

        Ok(rollups
            .into_iter()
            .map(|r| {
                let failed = r.total_checks - r.successful_checks;
                RankedDataset {
                    uptime_percentage: round2(uptime_of(&r)),
                    failure_rate: round2(uptime_percentage(failed, r.total_checks)),
                    avg_latency: round2(latency_of(&r)),
                    failed_checks: failed,
                    total_checks: r.total_checks,
                    dataset_id: r.dataset_id,
                    name: r.name,
                    category: r.category,
                }
            })
            .collect())
    }
}

fn uptime_of(r: &DatasetRollup) -> f64 {
    uptime_percentage(r.successful_checks, r.total_checks)
}

fn latency_of(r: &DatasetRollup) -> f64 {
    r.avg_latency.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckResult, Dataset};
    use crate::testutil::temp_store;
    use chrono::TimeZone;

    fn record(store: &Store, id: &str, category: &str, up: bool, latency: f64, at: DateTime<Utc>) {
        let ds = Dataset::new(id, &id.to_uppercase(), category, "http://unused");
        let result = if up {
            CheckResult::up(&ds, 200, latency, at)
        } else {
            CheckResult::down(&ds, Some(503), Some(latency), "HttpStatus", at)
        };
        store.save(&result).unwrap();
    }

    fn ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(minutes)
    }

    #[test]
    fn test_reliability_score_formula() {
        assert_eq!(reliability_score(100.0, 0.0), 100.0);
        assert_eq!(reliability_score(100.0, 25_000.0), 80.0);
        assert_eq!(reliability_score(50.0, 0.0), 50.0);
        assert_eq!(reliability_score(10.0, 30_000.0), 0.0);
        assert_eq!(reliability_score(90.0, 1_500.0), 88.5);
    }

    #[test]
    fn test_trend_needs_six_records() {
        use CheckStatus::{Down, Up};
        assert_eq!(reliability_trend(&[]), Trend::Stable);
        assert_eq!(reliability_trend(&[Up, Up, Down, Down, Down]), Trend::Stable);
        assert_eq!(reliability_trend(&[Up, Up, Up, Down, Down, Down]), Trend::Improving);
        assert_eq!(reliability_trend(&[Down, Down, Down, Up, Up, Up]), Trend::Declining);
        assert_eq!(reliability_trend(&[Up, Down, Up, Down, Up, Down]), Trend::Stable);
        // Odd length: the older half gets the extra record.
        assert_eq!(reliability_trend(&[Up, Up, Up, Up, Up, Up, Down]), Trend::Improving);
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_window(dt, 60), Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 900), Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 3600), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 0), dt);
    }

    #[test]
    fn test_empty_window_is_all_zero() {
        let (_tmp, store) = temp_store();
        let engine = AnalyticsEngine::new(store);

        let m = engine.system_metrics(24);
        assert_eq!(m.checks_performed, 0);
        assert_eq!(m.uptime_percentage, 0.0);
        assert_eq!(m.reliability_score, 0.0);
        assert_eq!(m.most_problematic_category, NO_PROBLEM_CATEGORY);

        assert!(engine.dataset_metrics("missing", 7).is_none());
        assert!(engine.category_analytics(24).is_empty());
        assert!(engine.timeline(24, 60).is_empty());
        assert!(engine.top_performing(10, 24).is_empty());
    }

    #[test]
    fn test_oversized_windows_are_clamped() {
        let (_tmp, store) = temp_store();
        record(&store, "a", "econ", true, 100.0, ago(10));
        let engine = AnalyticsEngine::new(store);

        let m = engine.system_metrics(100_000_000_000);
        assert_eq!(m.window_hours, MAX_WINDOW_HOURS);
        assert_eq!(m.checks_performed, 1);
        assert_eq!(engine.system_metrics(-5).window_hours, 1);

        let d = engine.dataset_metrics("a", i64::MAX).unwrap();
        assert_eq!(d.window_days, MAX_WINDOW_HOURS / 24);
        assert_eq!(engine.category_analytics(i64::MAX).len(), 1);
        assert_eq!(engine.timeline(i64::MAX, i64::MAX).len(), 1);
        assert!(engine.top_performing(10, i64::MAX).is_empty());
        assert!(engine.problematic(10, i64::MIN).is_empty());
    }

    #[test]
    fn test_system_metrics_uses_latest_status_per_dataset() {
        let (_tmp, store) = temp_store();
        record(&store, "a", "econ", false, 100.0, ago(20));
        record(&store, "a", "econ", true, 100.0, ago(10));
        record(&store, "b", "econ", true, 300.0, ago(10));
        record(&store, "c", "health", false, 500.0, ago(10));
        // Outside the window.
        record(&store, "d", "old", false, 1.0, ago(180));

        let m = AnalyticsEngine::new(store).system_metrics(1);
        assert_eq!(m.total_datasets, 3);
        assert_eq!(m.available_datasets, 2);
        assert_eq!(m.unavailable_datasets, 1);
        assert_eq!(m.checks_performed, 4);
        assert_eq!(m.uptime_percentage, 50.0);
        assert_eq!(m.avg_latency, 250.0);
        assert_eq!(m.max_latency, 500.0);
        assert_eq!(m.min_latency, 100.0);
        assert_eq!(m.reliability_score, 49.75);
        assert_eq!(m.most_problematic_category, "health");
        assert_eq!(m.categories_count, 2);
    }

    #[test]
    fn test_most_problematic_category_ties_break_alphabetically() {
        let (_tmp, store) = temp_store();
        record(&store, "z1", "zoning", false, 1.0, ago(5));
        record(&store, "t1", "transport", false, 1.0, ago(5));
        record(&store, "h1", "health", true, 1.0, ago(5));

        let m = AnalyticsEngine::new(store).system_metrics(1);
        assert_eq!(m.most_problematic_category, "transport");
    }

    #[test]
    fn test_dataset_metrics() {
        let (_tmp, store) = temp_store();
        let failure_at = ago(60 * 30);
        for i in 0..3 {
            record(&store, "a", "econ", true, 10.0, ago(i * 60));
        }
        record(&store, "a", "econ", false, 40.0, failure_at);
        for i in 0..3 {
            record(&store, "a", "econ", false, 40.0, ago(60 * 48 + i));
        }

        let m = AnalyticsEngine::new(store).dataset_metrics("a", 7).unwrap();
        assert_eq!(m.total_checks, 7);
        assert_eq!(m.successful_checks, 3);
        assert_eq!(m.failed_checks, 4);
        assert_eq!(m.uptime_percentage, 42.86);
        assert_eq!(m.avg_latency, round2(190.0 / 7.0));
        assert_eq!(m.last_failure, Some(failure_at));
        assert_eq!(m.failure_frequency, round2(4.0 / 7.0));
        assert_eq!(m.reliability_trend, Trend::Improving);
        assert_eq!(m.dataset_name, "A");
    }

    #[test]
    fn test_category_analytics_sorted_by_dataset_count() {
        let (_tmp, store) = temp_store();
        record(&store, "a", "small", true, 10.0, ago(5));
        record(&store, "b", "big", true, 10.0, ago(5));
        record(&store, "c", "big", false, 30.0, ago(5));

        let cats = AnalyticsEngine::new(store).category_analytics(24);
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].category, "big");
        assert_eq!(cats[0].total_datasets, 2);
        assert_eq!(cats[0].uptime_percentage, 50.0);
        assert_eq!(cats[0].avg_latency, 20.0);
        assert_eq!(cats[1].category, "small");
    }

    #[test]
    fn test_timeline_buckets_are_aligned() {
        let (_tmp, store) = temp_store();
        let times = [ago(200), ago(190), ago(30)];
        record(&store, "a", "c", true, 10.0, times[0]);
        record(&store, "a", "c", false, 30.0, times[1]);
        record(&store, "a", "c", true, 50.0, times[2]);

        let points = AnalyticsEngine::new(store).timeline(24, 0);
        let mut expected: Vec<DateTime<Utc>> = times.iter().map(|t| truncate_to_window(*t, 3600)).collect();
        expected.dedup();
        assert_eq!(points.iter().map(|p| p.timestamp).collect::<Vec<_>>(), expected);

        let checks: i64 = points.iter().map(|p| p.total_checks).sum();
        assert_eq!(checks, 3);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(points.iter().all(|p| p.timestamp.timestamp() % 3600 == 0));
    }

    #[test]
    fn test_rankings_require_min_samples_and_break_ties_by_latency() {
        let (_tmp, store) = temp_store();
        for i in 0..3 {
            record(&store, "fast", "c", true, 10.0, ago(i));
            record(&store, "slow", "c", true, 90.0, ago(i));
            record(&store, "flaky", "c", i != 0, 20.0, ago(i));
            record(&store, "dead-fast", "c", false, 5.0, ago(i));
            record(&store, "dead-slow", "c", false, 900.0, ago(i));
        }
        // Too few samples to rank.
        record(&store, "new", "c", false, 1.0, ago(1));

        let engine = AnalyticsEngine::new(store);

        let top: Vec<_> = engine.top_performing(3, 24).into_iter().map(|r| r.dataset_id).collect();
        assert_eq!(top, vec!["fast", "slow", "flaky"]);

        let bad = engine.problematic(10, 24);
        let ids: Vec<_> = bad.iter().map(|r| r.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["dead-slow", "dead-fast", "flaky", "slow", "fast"]);
        assert_eq!(bad[0].failure_rate, 100.0);
        assert_eq!(bad[2].failed_checks, 1);
    }

    #[test]
    fn test_store_failure_degrades_to_defaults() {
        let (_tmp, store) = temp_store();
        record(&store, "a", "c", true, 10.0, ago(1));
        store.conn().execute("DROP TABLE dataset_status", []).unwrap();

        let engine = AnalyticsEngine::new(store);
        assert_eq!(engine.system_metrics(24).checks_performed, 0);
        assert!(engine.dataset_metrics("a", 7).is_none());
        assert!(engine.category_analytics(24).is_empty());
        assert!(engine.timeline(24, 60).is_empty());
        assert!(engine.problematic(10, 24).is_empty());
    }
}
