//! HTTP request handlers.

use super::AppState;
use crate::analytics::{clamp_days, clamp_hours, hours_ago};
use crate::db::{ApiKey, CheckResult, Tier};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Analytics results are cached briefly; listing results until the next tick.
const ANALYTICS_TTL: Duration = Duration::from_secs(60);

// ============================================================================
// Query parameters
// ============================================================================

fn default_hours() -> i64 {
    24
}

fn default_days() -> i64 {
    7
}

fn default_limit() -> usize {
    10
}

fn default_interval() -> i64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
    /// Bucket width in minutes.
    #[serde(default = "default_interval")]
    pub interval: i64,
}

#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

fn error_json(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

/// Serve from the response cache, computing on a miss.
fn cached<T: Serialize>(state: &AppState, key: &str, ttl: Option<Duration>, compute: impl FnOnce() -> T) -> Json<Value> {
    Json(state.cache.get_or_insert_with(key, ttl, || {
        serde_json::to_value(compute()).unwrap_or(Value::Null)
    }))
}

// ============================================================================
// Status
// ============================================================================

/// Health check. A valid key, if presented, is echoed back so clients can
/// confirm which key they are using.
pub async fn handle_health(State(state): State<AppState>, key: Option<Extension<ApiKey>>) -> impl IntoResponse {
    let api_key = key.map(|Extension(k)| json!({ "key_id": k.key_id, "tier": k.tier }));
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "monitor": state.monitor.status(),
        "api_key": api_key,
    }))
}

#[derive(Debug, Serialize)]
struct StatusSummary {
    total: usize,
    available: usize,
    unavailable: usize,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    cached(&state, "datasets:status", None, || {
        let latest: Vec<CheckResult> = state.store.latest_per_dataset().unwrap_or_else(|e| {
            tracing::warn!("Status unavailable: {}", e);
            Vec::new()
        });
        let available = latest.iter().filter(|r| r.status.is_up()).count();
        let summary = StatusSummary {
            total: latest.len(),
            available,
            unavailable: latest.len() - available,
        };
        json!({
            "summary": summary,
            "last_check": latest.iter().map(|r| r.checked_at).max(),
            "datasets": latest,
        })
    })
}

pub async fn handle_datasets(State(state): State<AppState>) -> impl IntoResponse {
    cached(&state, "datasets:registry", None, || {
        state.store.registered_datasets(true).unwrap_or_else(|e| {
            tracing::warn!("Dataset registry unavailable: {}", e);
            Vec::new()
        })
    })
}

pub async fn handle_dataset_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.latest_for(&id) {
        Ok(Some(latest)) => Json(latest).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "not_found", "no checks recorded for dataset"),
        Err(e) => {
            tracing::warn!(dataset_id = %id, "Latest status unavailable: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "status unavailable")
        }
    }
}

pub async fn handle_dataset_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HoursQuery>,
) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    let key = format!("datasets:history:{}:{}", id, hours);
    cached(&state, &key, None, || {
        let since = hours_ago(hours);
        let history = state.store.history(&id, since).unwrap_or_else(|e| {
            tracing::warn!(dataset_id = %id, "History unavailable: {}", e);
            Vec::new()
        });
        json!({ "dataset_id": id, "hours": hours, "history": history })
    })
}

pub async fn handle_stats(State(state): State<AppState>, Query(q): Query<HoursQuery>) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    cached(&state, &format!("datasets:stats:{}", hours), None, || {
        let since = hours_ago(hours);
        let stats = state.store.availability_stats(since).unwrap_or_else(|e| {
            tracing::warn!("Stats unavailable: {}", e);
            Default::default()
        });
        json!({ "hours": hours, "stats": stats })
    })
}

pub async fn handle_categories(State(state): State<AppState>) -> impl IntoResponse {
    cached(&state, "datasets:categories", None, || {
        let registry = state.store.registered_datasets(true).unwrap_or_else(|e| {
            tracing::warn!("Dataset registry unavailable: {}", e);
            Vec::new()
        });
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for ds in registry {
            *counts.entry(ds.dataset.category).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(category, datasets)| json!({ "category": category, "datasets": datasets }))
            .collect::<Vec<_>>()
    })
}

pub async fn handle_force_check(State(state): State<AppState>) -> Response {
    match state.monitor.force_check().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_json(StatusCode::SERVICE_UNAVAILABLE, "check_failed", &e.to_string()),
    }
}

// ============================================================================
// Admin
// ============================================================================

pub async fn handle_clear_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.cache.clear();
    Json(json!({ "message": "Cache cleared" }))
}

pub async fn handle_cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

pub async fn handle_scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.status())
}

// ============================================================================
// Notifications
// ============================================================================

pub async fn handle_get_notifications(
    State(state): State<AppState>,
    Query(q): Query<NotificationsQuery>,
) -> impl IntoResponse {
    let notifications = state.hub.get_recent(q.limit.unwrap_or(50));
    Json(json!({
        "notifications": notifications,
        "unread_count": state.hub.unread_count(),
    }))
}

pub async fn handle_mark_read(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    if state.hub.mark_read(id) {
        Json(json!({ "id": id, "read": true })).into_response()
    } else {
        error_json(StatusCode::NOT_FOUND, "not_found", "notification not found")
    }
}

pub async fn handle_clear_notifications(State(state): State<AppState>) -> impl IntoResponse {
    state.hub.clear_all();
    Json(json!({ "cleared": true }))
}

// ============================================================================
// Analytics
// ============================================================================

pub async fn handle_system_metrics(State(state): State<AppState>, Query(q): Query<HoursQuery>) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    cached(&state, &format!("analytics:metrics:{}", hours), Some(ANALYTICS_TTL), || {
        state.analytics.system_metrics(hours)
    })
}

pub async fn handle_category_analytics(
    State(state): State<AppState>,
    Query(q): Query<HoursQuery>,
) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    cached(&state, &format!("analytics:categories:{}", hours), Some(ANALYTICS_TTL), || {
        state.analytics.category_analytics(hours)
    })
}

pub async fn handle_timeline(State(state): State<AppState>, Query(q): Query<TimelineQuery>) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    let key = format!("analytics:timeline:{}:{}", hours, q.interval);
    cached(&state, &key, Some(ANALYTICS_TTL), || state.analytics.timeline(hours, q.interval))
}

pub async fn handle_top_datasets(State(state): State<AppState>, Query(q): Query<RankingQuery>) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    let key = format!("analytics:top:{}:{}", q.limit, hours);
    cached(&state, &key, Some(ANALYTICS_TTL), || state.analytics.top_performing(q.limit, hours))
}

pub async fn handle_problematic_datasets(
    State(state): State<AppState>,
    Query(q): Query<RankingQuery>,
) -> impl IntoResponse {
    let hours = clamp_hours(q.hours);
    let key = format!("analytics:problematic:{}:{}", q.limit, hours);
    cached(&state, &key, Some(ANALYTICS_TTL), || state.analytics.problematic(q.limit, hours))
}

pub async fn handle_dataset_analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DaysQuery>,
) -> Response {
    match state.analytics.dataset_metrics(&id, clamp_days(q.days)) {
        Some(metrics) => Json(metrics).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "not_found", "no checks recorded for dataset"),
    }
}

// ============================================================================
// Developer keys
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateKeyRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub description: String,
}

pub async fn handle_generate_key(State(state): State<AppState>, Json(req): Json<GenerateKeyRequest>) -> Response {
    if req.name.trim().is_empty() || !req.email.contains('@') {
        return error_json(StatusCode::BAD_REQUEST, "invalid_request", "name and a valid email are required");
    }
    let tier = match req.tier.as_deref().map(str::parse::<Tier>) {
        None => Tier::Free,
        Some(Ok(tier)) => tier,
        Some(Err(e)) => return error_json(StatusCode::BAD_REQUEST, "invalid_request", &e),
    };

    match state.gate.generate_key(req.name.trim(), req.email.trim(), tier, &req.description) {
        Ok(issued) => (
            StatusCode::CREATED,
            Json(json!({
                "key": issued,
                "message": "Store the secret now; it cannot be shown again.",
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Keys issued to the caller's email address.
pub async fn handle_list_keys(State(state): State<AppState>, Extension(key): Extension<ApiKey>) -> Response {
    match state.gate.list_keys(&key.user_email) {
        Ok(keys) => Json(json!({ "keys": keys })).into_response(),
        Err(e) => e.into_response(),
    }
}

fn ensure_owner(key: &ApiKey, key_id: &str) -> Result<(), Response> {
    if key.key_id == key_id {
        Ok(())
    } else {
        Err(error_json(StatusCode::FORBIDDEN, "forbidden", "a key may only manage itself"))
    }
}

pub async fn handle_key_stats(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Path(key_id): Path<String>,
    Query(q): Query<HoursQuery>,
) -> Response {
    if let Err(denied) = ensure_owner(&key, &key_id) {
        return denied;
    }
    let hours = clamp_hours(q.hours);
    let stats = match state.gate.key_stats(&key_id, hours) {
        Ok(stats) => stats,
        Err(e) => return e.into_response(),
    };
    match state.gate.quota(&key) {
        Ok(quota) => Json(json!({
            "key_id": key.key_id,
            "tier": key.tier,
            "hours": hours,
            "rate_limit": quota,
            "stats": stats,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn handle_deactivate_key(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Path(key_id): Path<String>,
) -> Response {
    if let Err(denied) = ensure_owner(&key, &key_id) {
        return denied;
    }
    match state.gate.deactivate_key(&key_id) {
        Ok(deactivated) => Json(json!({ "key_id": key_id, "deactivated": deactivated })).into_response(),
        Err(e) => e.into_response(),
    }
}
