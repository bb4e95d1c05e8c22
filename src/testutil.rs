//! Shared test fixtures.

use axum::{http::StatusCode, routing::get, Router};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::db::{CheckResult, Dataset, Store};
use crate::probe::Probe;

/// Serve a small set of endpoints with known behavior on a random local port.
pub async fn spawn_test_server() -> SocketAddr {
    let router = Router::new()
        .route("/ok", get(|| async { StatusCode::OK }))
        .route(
            "/ok-50ms",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                StatusCode::OK
            }),
        )
        .route(
            "/error",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        )
        .route(
            "/head-rejected",
            get(|| async { StatusCode::OK }).head(|| async { StatusCode::METHOD_NOT_ALLOWED }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn dataset_for(addr: SocketAddr, id: &str, path: &str, timeout: f64) -> Dataset {
    let mut ds = Dataset::new(id, id, "test", &format!("http://{}{}", addr, path));
    ds.timeout = timeout;
    ds
}

pub fn temp_store() -> (NamedTempFile, Store) {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();
    (tmp, store)
}

/// A probe whose answers are scripted per dataset id. Unknown ids are up.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashMap<String, &'static str>>,
    delay: HashMap<String, Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProbe {
    pub fn with_delay(mut self, id: &str, delay: Duration) -> Self {
        self.delay.insert(id.to_string(), delay);
        self
    }

    pub fn set_down(&self, id: &str, tag: &'static str) {
        self.down.lock().insert(id.to_string(), tag);
    }

    pub fn set_up(&self, id: &str) {
        self.down.lock().remove(id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    fn probe<'a>(&'a self, dataset: &'a Dataset, checked_at: DateTime<Utc>) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay.get(&dataset.id) {
                tokio::time::sleep(*delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let tag = self.down.lock().get(&dataset.id).copied();
            match tag {
                Some(tag) => CheckResult::down(dataset, None, Some(1.0), tag, checked_at),
                None => CheckResult::up(dataset, 200, 1.0, checked_at),
            }
        })
    }
}
