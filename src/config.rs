//! Configuration module for datapulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

use crate::checker::DEFAULT_MAX_WORKERS;

/// Upper bound for `DATAPULSE_RETENTION_DAYS`, ten years.
const MAX_RETENTION_DAYS: i64 = 3_650;

/// Hourly and daily quota for one key tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierQuota {
    pub per_hour: i64,
    pub per_day: i64,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "datapulse.db")
    pub db_path: String,
    /// Path to the dataset YAML file (default: "sources.yaml")
    pub sources_path: String,
    pub check_interval_secs: u64,
    pub max_workers: usize,
    pub retention_days: i64,
    pub notification_cap: usize,
    pub free: TierQuota,
    pub pro: TierQuota,
    pub enterprise: TierQuota,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "datapulse.db".to_string(),
            sources_path: "sources.yaml".to_string(),
            check_interval_secs: 300,
            max_workers: DEFAULT_MAX_WORKERS,
            retention_days: 7,
            notification_cap: 100,
            free: TierQuota { per_hour: 100, per_day: 1_000 },
            pro: TierQuota { per_hour: 1_000, per_day: 10_000 },
            enterprise: TierQuota { per_hour: 10_000, per_day: 100_000 },
        }
    }
}

/// Overwrite `target` with the parsed value of `var`, if set and valid.
fn override_from<T: FromStr>(target: &mut T, var: &str) {
    if let Ok(raw) = env::var(var) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", var, raw),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has a `DATAPULSE_*` variable; unparseable values keep the default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        override_from(&mut cfg.http_port, "DATAPULSE_HTTP_PORT");
        if let Ok(db_path) = env::var("DATAPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(sources_path) = env::var("DATAPULSE_SOURCES_PATH") {
            cfg.sources_path = sources_path;
        }
        override_from(&mut cfg.check_interval_secs, "DATAPULSE_CHECK_INTERVAL_SECS");
        override_from(&mut cfg.max_workers, "DATAPULSE_MAX_WORKERS");
        override_from(&mut cfg.retention_days, "DATAPULSE_RETENTION_DAYS");
        override_from(&mut cfg.notification_cap, "DATAPULSE_NOTIFICATION_CAP");

        for (quota, prefix) in [
            (&mut cfg.free, "DATAPULSE_FREE"),
            (&mut cfg.pro, "DATAPULSE_PRO"),
            (&mut cfg.enterprise, "DATAPULSE_ENTERPRISE"),
        ] {
            override_from(&mut quota.per_hour, &format!("{}_PER_HOUR", prefix));
            override_from(&mut quota.per_day, &format!("{}_PER_DAY", prefix));
        }

        cfg.check_interval_secs = cfg.check_interval_secs.max(1);
        cfg.max_workers = cfg.max_workers.max(1);
        cfg.retention_days = cfg.retention_days.clamp(1, MAX_RETENTION_DAYS);
        cfg
    }
}
