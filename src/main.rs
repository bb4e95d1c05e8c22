//! DataPulse - Dataset Availability Monitoring
//!
//! Periodically probes a configured set of dataset endpoints, records their
//! availability and serves status, analytics and notifications over HTTP.

mod analytics;
mod auth;
mod cache;
mod checker;
mod config;
mod db;
mod notification;
mod probe;
mod scheduler;
mod sources;
mod web;

#[cfg(test)]
mod testutil;

use analytics::AnalyticsEngine;
use auth::{ApiGate, TierPolicies};
use cache::ResponseCache;
use checker::Checker;
use config::ServerConfig;
use db::Store;
use notification::{NotificationHub, NotificationKind};
use probe::HttpProber;
use scheduler::{spawn_periodic, Monitor, MonitorConfig};
use sources::YamlSource;
use web::{AppState, Server};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("datapulse=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting DataPulse on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Loading datasets from {}", cfg.sources_path);

    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let hub = Arc::new(NotificationHub::new(cfg.notification_cap, ChronoDuration::days(7)));
    hub.subscribe(|n| {
        match n.kind {
            NotificationKind::Error | NotificationKind::Warning => {
                tracing::warn!(id = n.id, "{}: {}", n.title, n.message)
            }
            _ => tracing::info!(id = n.id, "{}: {}", n.title, n.message),
        }
        Ok(())
    });

    let cache = Arc::new(ResponseCache::default());
    let checker = Checker::new(Arc::new(HttpProber::new()?), cfg.max_workers);
    let monitor = Arc::new(Monitor::new(
        store.clone(),
        checker,
        Arc::new(YamlSource::new(&cfg.sources_path)),
        hub.clone(),
        cache.clone(),
        MonitorConfig {
            interval: Duration::from_secs(cfg.check_interval_secs),
            retention_days: cfg.retention_days,
            ..MonitorConfig::default()
        },
    ));

    // Housekeeping
    let token = CancellationToken::new();
    let prune_hub = hub.clone();
    let hub_pruner = spawn_periodic("notification-prune", Duration::from_secs(3600), token.clone(), move || {
        let hub = prune_hub.clone();
        async move {
            hub.prune_expired();
        }
    });
    let sweep_cache = cache.clone();
    let cache_sweeper = spawn_periodic("cache-cleanup", Duration::from_secs(60), token.clone(), move || {
        let cache = sweep_cache.clone();
        async move {
            cache.cleanup_expired();
        }
    });

    monitor.start();

    let state = AppState {
        config: cfg.clone(),
        analytics: AnalyticsEngine::new(store.clone()),
        gate: ApiGate::new(store.clone(), TierPolicies::from_config(&cfg)),
        store,
        monitor: monitor.clone(),
        hub,
        cache,
    };
    let server = Server::new(state);
    let served = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    token.cancel();
    monitor.stop().await;
    let _ = tokio::join!(hub_pruner, cache_sweeper);

    served
}
