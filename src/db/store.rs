//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// A single connection behind a mutex serializes every statement, so a prune
/// can never interleave with a half-written batch.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const CHECK_COLUMNS: &str =
    "dataset_id, name, category, url, status, http_code, latency_ms, error, checked_at";

impl Store {
    /// Open (or create) the store at the given path and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(())
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // --- Dataset registry ---

    /// Upsert dataset metadata keyed by id. History is untouched.
    pub fn register_datasets(&self, datasets: &[Dataset]) -> Result<(), StoreError> {
        if datasets.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let now = format_db_time(Utc::now());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO datasets (id, name, category, url, description, method, timeout, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                 name=excluded.name, category=excluded.category, url=excluded.url,
                 description=excluded.description, method=excluded.method, timeout=excluded.timeout,
                 active=1, updated_at=excluded.updated_at",
            )?;

            for ds in datasets {
                stmt.execute(params![
                    ds.id,
                    ds.name,
                    ds.category,
                    ds.url,
                    ds.description,
                    ds.method.as_str(),
                    ds.timeout,
                    now,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Registered datasets ordered by category then name.
    pub fn registered_datasets(&self, active_only: bool) -> Result<Vec<RegisteredDataset>, StoreError> {
        let conn = self.conn.lock();
        let sql = if active_only {
            "SELECT id, name, category, url, description, method, timeout, active, updated_at
             FROM datasets WHERE active = 1 ORDER BY category, name"
        } else {
            "SELECT id, name, category, url, description, method, timeout, active, updated_at
             FROM datasets ORDER BY category, name"
        };
        let mut stmt = conn.prepare(sql)?;

        let datasets = stmt
            .query_map([], |row| {
                let method: String = row.get(5)?;
                Ok(RegisteredDataset {
                    dataset: Dataset {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        category: row.get(2)?,
                        url: row.get(3)?,
                        description: row.get(4)?,
                        method: method.parse().unwrap_or_default(),
                        timeout: row.get(6)?,
                    },
                    active: row.get(7)?,
                    updated_at: time_from_row(row, 8)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(datasets)
    }

    // --- Status history ---

    /// Append one check result.
    pub fn save(&self, result: &CheckResult) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO dataset_status ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                CHECK_COLUMNS
            ),
            params![
                result.dataset_id,
                result.name,
                result.category,
                result.url,
                result.status.as_str(),
                result.http_code,
                result.latency_ms,
                result.error,
                format_db_time(result.checked_at),
            ],
        )?;
        Ok(())
    }

    /// The most recent record of every dataset in the store.
    pub fn latest_per_dataset(&self) -> Result<Vec<CheckResult>, StoreError> {
        self.latest_where("1 = 1", None)
    }

    /// The most recent record of every dataset checked since `since`.
    pub fn latest_since(&self, since: DateTime<Utc>) -> Result<Vec<CheckResult>, StoreError> {
        self.latest_where("checked_at >= ?1", Some(since))
    }

    fn latest_where(
        &self,
        filter: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {cols} FROM (
                SELECT {cols}, ROW_NUMBER() OVER (
                    PARTITION BY dataset_id ORDER BY checked_at DESC, id DESC
                ) AS rn
                FROM dataset_status WHERE {filter}
             ) WHERE rn = 1 ORDER BY category, name",
            cols = CHECK_COLUMNS,
            filter = filter,
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = match since {
            Some(since) => stmt
                .query_map(params![format_db_time(since)], check_from_row)?
                .collect::<SqlResult<Vec<_>>>()?,
            None => stmt
                .query_map([], check_from_row)?
                .collect::<SqlResult<Vec<_>>>()?,
        };

        Ok(rows)
    }

    /// The most recent record of one dataset.
    pub fn latest_for(&self, dataset_id: &str) -> Result<Option<CheckResult>, StoreError> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM dataset_status WHERE dataset_id = ?1
                     ORDER BY checked_at DESC, id DESC LIMIT 1",
                    CHECK_COLUMNS
                ),
                params![dataset_id],
                check_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All records for one dataset since `since`, most recent first.
    pub fn history(&self, dataset_id: &str, since: DateTime<Utc>) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dataset_status
             WHERE dataset_id = ?1 AND checked_at >= ?2
             ORDER BY checked_at DESC, id DESC",
            CHECK_COLUMNS
        ))?;

        let results = stmt
            .query_map(params![dataset_id, format_db_time(since)], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Aggregate availability since `since`, overall and per category.
    pub fn availability_stats(&self, since: DateTime<Utc>) -> Result<AvailabilityStats, StoreError> {
        let since = format_db_time(since);
        let conn = self.conn.lock();

        let mut stats = conn.query_row(
            "SELECT COUNT(DISTINCT dataset_id), COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    AVG(latency_ms)
             FROM dataset_status WHERE checked_at >= ?1",
            params![since],
            |row| {
                Ok(AvailabilityStats {
                    total_datasets: row.get(0)?,
                    total_checks: row.get(1)?,
                    successful_checks: row.get(2)?,
                    avg_latency: row.get(3)?,
                    by_category: Vec::new(),
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT category, COUNT(DISTINCT dataset_id), COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    AVG(latency_ms)
             FROM dataset_status WHERE checked_at >= ?1
             GROUP BY category ORDER BY category",
        )?;
        stats.by_category = stmt
            .query_map(params![since], |row| {
                Ok(CategoryStats {
                    category: row.get(0)?,
                    dataset_count: row.get(1)?,
                    check_count: row.get(2)?,
                    successful_count: row.get(3)?,
                    avg_latency: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(stats)
    }

    /// Whole-window aggregates including latency extremes.
    pub fn check_aggregate(&self, since: DateTime<Utc>) -> Result<CheckAggregate, StoreError> {
        let conn = self.conn.lock();
        let agg = conn.query_row(
            "SELECT COUNT(DISTINCT dataset_id), COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    AVG(latency_ms), MAX(latency_ms), MIN(latency_ms)
             FROM dataset_status WHERE checked_at >= ?1",
            params![format_db_time(since)],
            |row| {
                Ok(CheckAggregate {
                    total_datasets: row.get(0)?,
                    total_checks: row.get(1)?,
                    successful_checks: row.get(2)?,
                    avg_latency: row.get(3)?,
                    max_latency: row.get(4)?,
                    min_latency: row.get(5)?,
                })
            },
        )?;
        Ok(agg)
    }

    /// Per-dataset check counts since `since`.
    pub fn dataset_rollups(&self, since: DateTime<Utc>) -> Result<Vec<DatasetRollup>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT dataset_id, MAX(name), MAX(category), COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    AVG(latency_ms)
             FROM dataset_status WHERE checked_at >= ?1
             GROUP BY dataset_id",
        )?;

        let rollups = stmt
            .query_map(params![format_db_time(since)], |row| {
                Ok(DatasetRollup {
                    dataset_id: row.get(0)?,
                    name: row.get(1)?,
                    category: row.get(2)?,
                    total_checks: row.get(3)?,
                    successful_checks: row.get(4)?,
                    avg_latency: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rollups)
    }

    /// Status and latency of every check since `since`, oldest first.
    pub fn samples_since(&self, since: DateTime<Utc>) -> Result<Vec<CheckSample>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT checked_at, status, latency_ms FROM dataset_status
             WHERE checked_at >= ?1 ORDER BY checked_at ASC, id ASC",
        )?;

        let samples = stmt
            .query_map(params![format_db_time(since)], |row| {
                Ok(CheckSample {
                    checked_at: time_from_row(row, 0)?,
                    status: status_from_row(row, 1)?,
                    latency_ms: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Delete check results older than `days` days. Returns the number removed.
    pub fn prune(&self, days: i64) -> Result<usize, StoreError> {
        self.prune_before(Utc::now() - ChronoDuration::days(days))
    }

    /// Delete check results checked before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM dataset_status WHERE checked_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(removed)
    }
}

fn check_from_row(row: &Row<'_>) -> SqlResult<CheckResult> {
    Ok(CheckResult {
        dataset_id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        url: row.get(3)?,
        status: status_from_row(row, 4)?,
        http_code: row.get(5)?,
        latency_ms: row.get(6)?,
        error: row.get(7)?,
        checked_at: time_from_row(row, 8)?,
    })
}

fn status_from_row(row: &Row<'_>, idx: usize) -> SqlResult<CheckStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

pub(crate) fn time_from_row(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
