//! Concurrent checker: runs a probe over every dataset with bounded parallelism.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::db::{CheckResult, Dataset};
use crate::probe::{Probe, ProbeFailure};

/// Default number of probes in flight at once.
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("no datasets to check")]
    NoDatasets,
}

/// Checks a set of datasets with at most `max_workers` probes in flight.
#[derive(Clone)]
pub struct Checker {
    probe: Arc<dyn Probe>,
    max_workers: usize,
}

impl Checker {
    pub fn new(probe: Arc<dyn Probe>, max_workers: usize) -> Self {
        Self {
            probe,
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Check every dataset and return one result each, sorted by (category, name).
    pub async fn check_all(
        &self,
        datasets: &[Dataset],
        checked_at: DateTime<Utc>,
    ) -> Result<Vec<CheckResult>, CheckerError> {
        self.check_each(datasets, checked_at, |_| {}).await
    }

    /// Like [`check_all`](Self::check_all), calling `on_result` as each probe
    /// completes so fast results are visible while slow ones are still running.
    pub async fn check_each<F>(
        &self,
        datasets: &[Dataset],
        checked_at: DateTime<Utc>,
        mut on_result: F,
    ) -> Result<Vec<CheckResult>, CheckerError>
    where
        F: FnMut(&CheckResult),
    {
        if datasets.is_empty() {
            return Err(CheckerError::NoDatasets);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for dataset in datasets.iter().cloned() {
            let probe = self.probe.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                probe.probe(&dataset, checked_at).await
            });
        }

        let mut results = Vec::with_capacity(datasets.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    on_result(&result);
                    results.push(result);
                }
                Err(e) => tracing::error!("Checker: probe task failed: {}", e),
            }
        }

        // A panicked probe task still owes its dataset a result.
        let seen: HashSet<String> = results.iter().map(|r| r.dataset_id.clone()).collect();
        for dataset in datasets.iter().filter(|d| !seen.contains(&d.id)) {
            let result = CheckResult::down(dataset, None, None, ProbeFailure::TaskFailed.as_str(), checked_at);
            on_result(&result);
            results.push(result);
        }

        sort_results(&mut results);
        Ok(results)
    }
}

/// Stable ordering for downstream consumers.
pub fn sort_results(results: &mut [CheckResult]) {
    results.sort_by(|a, b| {
        (&a.category, &a.name, &a.dataset_id).cmp(&(&b.category, &b.name, &b.dataset_id))
    });
}
