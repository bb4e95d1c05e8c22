//! HTTP probe implementation.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::redirect::Policy;
use std::time::{Duration, Instant};

use super::{is_available, Probe, ProbeFailure};
use crate::db::{CheckResult, Dataset, ProbeMethod};

/// Probes datasets with HEAD (falling back to GET) or GET requests.
#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(10))
            .user_agent(concat!("datapulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Send one request and return the status code once headers arrive.
    async fn send(&self, method: ProbeMethod, url: &str, timeout: Duration) -> Result<u16, reqwest::Error> {
        let request = match method {
            ProbeMethod::Head => self.client.head(url),
            ProbeMethod::Get => self.client.get(url),
        };

        // The body is never read; dropping the response closes the stream.
        let response = request.timeout(timeout).send().await?;
        Ok(response.status().as_u16())
    }

    /// Check a dataset, measuring wall-clock time until response headers.
    pub async fn check(&self, dataset: &Dataset, checked_at: DateTime<Utc>) -> CheckResult {
        let timeout = dataset.timeout_duration();
        let start = Instant::now();

        let mut outcome = self.send(dataset.method, &dataset.url, timeout).await;

        // Some servers mishandle HEAD; retry with GET inside the remaining budget.
        if dataset.method == ProbeMethod::Head {
            if let Ok(code) = outcome {
                if code >= 400 {
                    tracing::debug!(dataset_id = %dataset.id, code, "HEAD rejected, retrying with GET");
                    let remaining = timeout.saturating_sub(start.elapsed());
                    outcome = self.send(ProbeMethod::Get, &dataset.url, remaining).await;
                }
            }
        }

        let latency_ms = round_ms(start.elapsed());

        match outcome {
            Ok(code) if is_available(code) => CheckResult::up(dataset, code, latency_ms, checked_at),
            Ok(code) => CheckResult::down(
                dataset,
                Some(code),
                Some(latency_ms),
                ProbeFailure::HttpStatus.as_str(),
                checked_at,
            ),
            Err(e) => {
                let failure = ProbeFailure::from_reqwest(&e);
                let latency_ms = if failure == ProbeFailure::Timeout {
                    latency_ms.max(round_ms(timeout))
                } else {
                    latency_ms
                };
                tracing::debug!(dataset_id = %dataset.id, error = %e, "Probe failed: {}", failure);
                CheckResult::down(dataset, None, Some(latency_ms), failure.as_str(), checked_at)
            }
        }
    }
}

impl Probe for HttpProber {
    fn probe<'a>(&'a self, dataset: &'a Dataset, checked_at: DateTime<Utc>) -> BoxFuture<'a, CheckResult> {
        Box::pin(self.check(dataset, checked_at))
    }
}

/// Milliseconds rounded to one decimal place.
fn round_ms(d: Duration) -> f64 {
    (d.as_secs_f64() * 10_000.0).round() / 10.0
}
