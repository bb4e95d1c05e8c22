//! API key and usage-log persistence.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{format_db_time, time_from_row, Store, StoreError};

const KEY_COLUMNS: &str = "key_id, key_hash, name, description, user_email, tier, created_at, \
     last_used, is_active, rate_limit_per_hour, rate_limit_per_day, allowed_endpoints";

impl Store {
    /// Insert a freshly generated key.
    pub fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        let endpoints = serde_json::to_string(&key.allowed_endpoints).unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO api_keys ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                KEY_COLUMNS
            ),
            params![
                key.key_id,
                key.key_hash,
                key.name,
                key.description,
                key.user_email,
                key.tier.as_str(),
                format_db_time(key.created_at),
                key.last_used.map(format_db_time),
                key.is_active,
                key.rate_limit_per_hour,
                key.rate_limit_per_day,
                endpoints,
            ],
        )?;
        Ok(())
    }

    /// Look up an active key by secret hash and stamp `last_used`.
    pub fn authenticate_key_hash(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKey>, StoreError> {
        let conn = self.conn();
        let key = conn
            .query_row(
                &format!(
                    "SELECT {} FROM api_keys WHERE key_hash = ?1 AND is_active = 1",
                    KEY_COLUMNS
                ),
                params![key_hash],
                key_from_row,
            )
            .optional()?;

        let Some(mut key) = key else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE api_keys SET last_used = ?1 WHERE key_id = ?2",
            params![format_db_time(now), key.key_id],
        )?;
        key.last_used = Some(now);
        Ok(Some(key))
    }

    /// Keys issued to one email address, newest first.
    pub fn list_api_keys(&self, user_email: &str) -> Result<Vec<ApiKey>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_keys WHERE user_email = ?1 ORDER BY created_at DESC",
            KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map(params![user_email], key_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(keys)
    }

    /// Soft-delete a key. Returns false if no active key had that id.
    pub fn deactivate_api_key(&self, key_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE key_id = ?1 AND is_active = 1",
            params![key_id],
        )?;
        Ok(changed > 0)
    }

    // --- Usage log ---

    /// Append a usage record and return its row id.
    pub fn insert_usage(&self, usage: &UsageRecord) -> Result<i64, StoreError> {
        let conn = self.conn();
        insert_usage_on(&conn, usage)
    }

    /// Count admitted usage in the trailing windows and append one record
    /// built from those counts, under a single lock so concurrent callers
    /// always observe each other's records.
    pub fn count_and_record_usage<F>(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
        build: F,
    ) -> Result<(UsageWindowCounts, i64), StoreError>
    where
        F: FnOnce(&UsageWindowCounts) -> UsageRecord,
    {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let counts = usage_counts_on(&tx, key_id, now)?;
        let record = build(&counts);
        let id = insert_usage_on(&tx, &record)?;
        tx.commit()?;
        Ok((counts, id))
    }

    /// Admitted usage counts in the trailing hour and day.
    pub fn usage_window_counts(&self, key_id: &str, now: DateTime<Utc>) -> Result<UsageWindowCounts, StoreError> {
        let conn = self.conn();
        Ok(usage_counts_on(&conn, key_id, now)?)
    }

    /// Fill in the outcome of a previously admitted call.
    pub fn complete_usage(&self, usage_id: i64, status_code: u16, response_time_ms: f64) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE api_usage SET status_code = ?1, response_time_ms = ?2 WHERE id = ?3",
            params![status_code, response_time_ms, usage_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Usage statistics for a key since `since`.
    pub fn key_usage_stats(&self, key_id: &str, since: DateTime<Utc>) -> Result<KeyUsageStats, StoreError> {
        let since = format_db_time(since);
        let conn = self.conn();

        let (total_requests, avg_response_time, first, last): (i64, Option<f64>, Option<String>, Option<String>) =
            conn.query_row(
                "SELECT COUNT(*), AVG(response_time_ms), MIN(timestamp), MAX(timestamp)
                 FROM api_usage WHERE key_id = ?1 AND timestamp >= ?2",
                params![key_id, since],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let mut stmt = conn.prepare(
            "SELECT endpoint, COUNT(*) AS count FROM api_usage
             WHERE key_id = ?1 AND timestamp >= ?2
             GROUP BY endpoint ORDER BY count DESC, endpoint ASC LIMIT 10",
        )?;
        let top_endpoints = stmt
            .query_map(params![key_id, since], |row| {
                Ok(EndpointCount {
                    endpoint: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT status_code, COUNT(*) AS count FROM api_usage
             WHERE key_id = ?1 AND timestamp >= ?2
             GROUP BY status_code ORDER BY count DESC, status_code ASC",
        )?;
        let status_codes = stmt
            .query_map(params![key_id, since], |row| {
                Ok(StatusCodeCount {
                    status_code: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(KeyUsageStats {
            total_requests,
            avg_response_time,
            first_request: first.as_deref().and_then(super::store::parse_db_time),
            last_request: last.as_deref().and_then(super::store::parse_db_time),
            top_endpoints,
            status_codes,
        })
    }
}

fn insert_usage_on(conn: &Connection, usage: &UsageRecord) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO api_usage
         (key_id, endpoint, method, timestamp, response_time_ms, status_code, admitted, user_agent, ip_address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            usage.key_id,
            usage.endpoint,
            usage.method,
            format_db_time(usage.timestamp),
            usage.response_time_ms,
            usage.status_code,
            usage.admitted,
            usage.user_agent,
            usage.ip_address,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn usage_counts_on(conn: &Connection, key_id: &str, now: DateTime<Utc>) -> SqlResult<UsageWindowCounts> {
    let hour_ago = format_db_time(now - ChronoDuration::hours(1));
    let day_ago = format_db_time(now - ChronoDuration::days(1));

    let mut counts = UsageWindowCounts::default();
    let (hour_count, oldest_hour): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MIN(timestamp) FROM api_usage
         WHERE key_id = ?1 AND admitted = 1 AND timestamp > ?2",
        params![key_id, hour_ago],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (day_count, oldest_day): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MIN(timestamp) FROM api_usage
         WHERE key_id = ?1 AND admitted = 1 AND timestamp > ?2",
        params![key_id, day_ago],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    counts.hour_count = hour_count;
    counts.day_count = day_count;
    counts.oldest_in_hour = oldest_hour.as_deref().and_then(super::store::parse_db_time);
    counts.oldest_in_day = oldest_day.as_deref().and_then(super::store::parse_db_time);
    Ok(counts)
}

fn key_from_row(row: &Row<'_>) -> SqlResult<ApiKey> {
    let tier: String = row.get(5)?;
    let endpoints: String = row.get(11)?;
    let last_used: Option<String> = row.get(7)?;

    Ok(ApiKey {
        key_id: row.get(0)?,
        key_hash: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        user_email: row.get(4)?,
        tier: tier.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        created_at: time_from_row(row, 6)?,
        last_used: last_used.as_deref().and_then(super::store::parse_db_time),
        is_active: row.get(8)?,
        rate_limit_per_hour: row.get(9)?,
        rate_limit_per_day: row.get(10)?,
        allowed_endpoints: serde_json::from_str(&endpoints).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}
