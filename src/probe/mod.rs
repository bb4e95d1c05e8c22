//! Probe module for dataset availability checks.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;

use crate::db::{CheckResult, Dataset};

/// Short, classifiable tag for why a probe reported `down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Connect,
    Redirect,
    Request,
    Body,
    Decode,
    Builder,
    HttpStatus,
    TaskFailed,
}

impl ProbeFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout => "Timeout",
            ProbeFailure::Connect => "ConnectError",
            ProbeFailure::Redirect => "RedirectError",
            ProbeFailure::Request => "RequestError",
            ProbeFailure::Body => "BodyError",
            ProbeFailure::Decode => "DecodeError",
            ProbeFailure::Builder => "BuilderError",
            ProbeFailure::HttpStatus => "HttpStatus",
            ProbeFailure::TaskFailed => "TaskFailed",
        }
    }

    /// Classify a transport error from the HTTP client.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeFailure::Timeout
        } else if err.is_connect() {
            ProbeFailure::Connect
        } else if err.is_redirect() {
            ProbeFailure::Redirect
        } else if err.is_builder() {
            ProbeFailure::Builder
        } else if err.is_body() {
            ProbeFailure::Body
        } else if err.is_decode() {
            ProbeFailure::Decode
        } else {
            ProbeFailure::Request
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single availability check of one dataset.
///
/// Implementations never fail: every outcome, including transport errors
/// and timeouts, is expressed as a [`CheckResult`].
pub trait Probe: Send + Sync {
    fn probe<'a>(&'a self, dataset: &'a Dataset, checked_at: DateTime<Utc>) -> BoxFuture<'a, CheckResult>;
}

/// Whether an HTTP status code counts as available.
pub fn is_available(code: u16) -> bool {
    (200..400).contains(&code)
}
