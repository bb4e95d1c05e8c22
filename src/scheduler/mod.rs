//! Monitor loop: runs the checker on a fixed interval, records results,
//! detects up/down transitions and prunes old history.

mod periodic;

pub use periodic::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{ResponseCache, DATASETS_PREFIX};
use crate::checker::{Checker, CheckerError};
use crate::db::{CheckStatus, Store};
use crate::notification::{NotificationHub, NotificationKind};
use crate::sources::{DatasetSource, SourceError};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("dataset configuration error: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Checker(#[from] CheckerError),
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub retention_days: i64,
    pub prune_every: Duration,
    /// How long `stop` waits for an in-flight tick before aborting it.
    pub stop_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retention_days: 7,
            prune_every: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub checked_at: DateTime<Utc>,
    pub total: usize,
    pub available: usize,
    pub saved: usize,
    pub transitions: usize,
    pub pruned: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub check_interval_secs: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Dependencies shared between the loop task and on-demand checks.
struct Shared {
    store: Store,
    hub: Arc<NotificationHub>,
    cache: Arc<ResponseCache>,
    source: Arc<dyn DatasetSource>,
    checker: Checker,
    config: MonitorConfig,
    // Held for the whole tick: ticks never overlap.
    tick_lock: tokio::sync::Mutex<TickState>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Default)]
struct TickState {
    last_prune: Option<Instant>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The monitor state machine: Stopped until `start`, Running until `stop`.
pub struct Monitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Monitor {
    pub fn new(
        store: Store,
        checker: Checker,
        source: Arc<dyn DatasetSource>,
        hub: Arc<NotificationHub>,
        cache: Arc<ResponseCache>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                hub,
                cache,
                source,
                checker,
                config,
                tick_lock: tokio::sync::Mutex::new(TickState::default()),
                last_tick: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the loop. The first tick runs immediately. Returns false if
    /// already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.shared.clone(), token.clone()));
        *running = Some(Running { token, handle });
        drop(running);

        tracing::info!(
            "Monitor started (interval {}s, {} workers)",
            self.shared.config.interval.as_secs(),
            self.shared.checker.max_workers()
        );
        self.shared.hub.system(
            NotificationKind::Info,
            "Monitoring started",
            &format!(
                "Dataset checks every {} seconds",
                self.shared.config.interval.as_secs()
            ),
        );
        true
    }

    /// Signal the loop to exit and wait for an in-flight tick, up to the
    /// stop timeout. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let taken = self.running.lock().take();
        let Some(Running { token, mut handle }) = taken else {
            return false;
        };

        token.cancel();
        match tokio::time::timeout(self.shared.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Monitor loop ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!("Monitor tick did not finish within stop timeout; aborting");
                handle.abort();
            }
        }

        tracing::info!("Monitor stopped");
        self.shared
            .hub
            .system(NotificationKind::Info, "Monitoring stopped", "Dataset checks paused");
        true
    }

    /// Run one tick now, after any tick already in flight.
    pub async fn force_check(&self) -> Result<TickSummary, MonitorError> {
        run_tick(&self.shared).await
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.is_running(),
            check_interval_secs: self.shared.config.interval.as_secs(),
            last_tick: *self.shared.last_tick.lock(),
        }
    }
}

async fn run_loop(shared: Arc<Shared>, token: CancellationToken) {
    while !token.is_cancelled() {
        // Errors are logged inside; the loop keeps going.
        let _ = run_tick(&shared).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(shared.config.interval) => {}
        }
    }
}

async fn run_tick(shared: &Shared) -> Result<TickSummary, MonitorError> {
    let result = tick(shared).await;
    if let Err(e) = &result {
        tracing::error!("Monitor tick skipped: {}", e);
    }
    result
}

async fn tick(shared: &Shared) -> Result<TickSummary, MonitorError> {
    let mut state = shared.tick_lock.lock().await;

    let datasets = shared.source.load()?;
    if let Err(e) = shared.store.register_datasets(&datasets) {
        tracing::warn!("Failed to register datasets: {}", e);
    }

    // Read before any probe is dispatched so this tick's writes are never seen.
    let previous: HashMap<String, CheckStatus> = match shared.store.latest_per_dataset() {
        Ok(latest) => latest.into_iter().map(|r| (r.dataset_id, r.status)).collect(),
        Err(e) => {
            tracing::warn!("Failed to read previous status, transitions skipped: {}", e);
            HashMap::new()
        }
    };

    let checked_at = Utc::now();
    let results = shared.checker.check_all(&datasets, checked_at).await?;

    let mut saved = 0;
    for result in &results {
        match shared.store.save(result) {
            Ok(()) => saved += 1,
            Err(e) => tracing::error!(dataset_id = %result.dataset_id, "Failed to save check result: {}", e),
        }
    }

    let mut transitions = 0;
    for result in &results {
        if let Some(prev) = previous.get(&result.dataset_id) {
            if *prev != result.status {
                tracing::info!(
                    dataset_id = %result.dataset_id,
                    "Status changed: {} -> {}",
                    prev,
                    result.status
                );
                shared.hub.dataset_transition(*prev, result);
                transitions += 1;
            }
        }
    }

    shared.cache.invalidate_prefix(DATASETS_PREFIX);

    let now = Instant::now();
    let due = state
        .last_prune
        .map_or(true, |at| now.duration_since(at) >= shared.config.prune_every);
    let pruned = if due {
        state.last_prune = Some(now);
        match shared.store.prune(shared.config.retention_days) {
            Ok(n) => {
                if n > 0 {
                    tracing::info!("Pruned {} check results older than {} days", n, shared.config.retention_days);
                }
                Some(n)
            }
            Err(e) => {
                tracing::error!("Failed to prune check results: {}", e);
                None
            }
        }
    } else {
        None
    };

    let available = results.iter().filter(|r| r.status.is_up()).count();
    tracing::info!(
        "Tick complete: {}/{} available, {} transitions",
        available,
        results.len(),
        transitions
    );
    *shared.last_tick.lock() = Some(checked_at);

    Ok(TickSummary {
        checked_at,
        total: results.len(),
        available,
        saved,
        transitions,
        pruned,
    })
}
