//! Web server module.

mod handlers;
mod middleware;

pub use handlers::*;
use middleware::API_V1;

use crate::analytics::AnalyticsEngine;
use crate::auth::ApiGate;
use crate::cache::ResponseCache;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::notification::NotificationHub;
use crate::scheduler::Monitor;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub monitor: Arc<Monitor>,
    pub analytics: AnalyticsEngine,
    pub hub: Arc<NotificationHub>,
    pub gate: ApiGate,
    pub cache: Arc<ResponseCache>,
}

/// Dataset status routes, served publicly and under the gated API.
fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/status", get(handlers::handle_status))
        .route("/datasets", get(handlers::handle_datasets))
        .route("/datasets/{id}", get(handlers::handle_dataset_status))
        .route("/datasets/{id}/history", get(handlers::handle_dataset_history))
        .route("/stats", get(handlers::handle_stats))
        .route("/categories", get(handlers::handle_categories))
        .route("/check", post(handlers::handle_force_check))
}

fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/analytics/metrics", get(handlers::handle_system_metrics))
        .route("/analytics/categories", get(handlers::handle_category_analytics))
        .route("/analytics/timeline", get(handlers::handle_timeline))
        .route("/analytics/datasets/top", get(handlers::handle_top_datasets))
        .route("/analytics/datasets/problematic", get(handlers::handle_problematic_datasets))
        .route("/analytics/dataset/{id}", get(handlers::handle_dataset_analytics))
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let versioned = core_routes()
        .merge(analytics_routes())
        .route_layer(from_fn_with_state(state.clone(), middleware::api_gate));

    // Key owners act on themselves: quotas apply, tier allowlists do not.
    let owner = from_fn_with_state(state.clone(), middleware::owner_gate);
    let developer = Router::new()
        .route("/developer/keys/{key_id}/stats", get(handlers::handle_key_stats))
        .route("/developer/keys/{key_id}/deactivate", post(handlers::handle_deactivate_key))
        .route_layer(owner.clone())
        .route(
            "/developer/keys",
            post(handlers::handle_generate_key).merge(get(handlers::handle_list_keys).route_layer(owner)),
        );

    let admin = Router::new()
        .route("/admin/cache", delete(handlers::handle_clear_cache))
        .route("/admin/cache/stats", get(handlers::handle_cache_stats))
        .route("/admin/scheduler", get(handlers::handle_scheduler_status));

    Router::new()
        .merge(core_routes().route_layer(from_fn_with_state(state.clone(), middleware::identify_key)))
        .nest("/api", analytics_routes())
        .route("/api/notifications", get(handlers::handle_get_notifications))
        .route("/api/notifications/{id}/read", post(handlers::handle_mark_read))
        .route("/api/notifications/clear", post(handlers::handle_clear_notifications))
        .merge(developer)
        .merge(admin)
        .nest(API_V1, versioned)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for DataPulse.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TierPolicies;
    use crate::checker::Checker;
    use crate::db::Dataset;
    use crate::scheduler::MonitorConfig;
    use crate::sources::StaticSource;
    use crate::testutil::{temp_store, ScriptedProbe};

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    struct Fixture {
        _tmp: NamedTempFile,
        state: AppState,
    }

    fn fixture_with(config: ServerConfig) -> Fixture {
        let (tmp, store) = temp_store();
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("beta", "HTTP 503");
        let hub = Arc::new(NotificationHub::default());
        let cache = Arc::new(ResponseCache::default());
        let source = Arc::new(StaticSource::new(vec![
            Dataset::new("alpha", "Alpha", "weather", "http://unused/a"),
            Dataset::new("beta", "Beta", "finance", "http://unused/b"),
        ]));
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            Checker::new(probe, 2),
            source,
            hub.clone(),
            cache.clone(),
            MonitorConfig::default(),
        ));
        let gate = ApiGate::new(store.clone(), TierPolicies::from_config(&config));
        Fixture {
            _tmp: tmp,
            state: AppState {
                config,
                analytics: AnalyticsEngine::new(store.clone()),
                store,
                monitor,
                hub,
                gate,
                cache,
            },
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ServerConfig::default())
    }

    async fn send(state: &AppState, method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn issue(state: &AppState, tier: crate::db::Tier) -> String {
        tokio_test::assert_ok!(state.gate.generate_key("dev", "dev@example.com", tier, "")).secret
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let response = send(&f.state, Method::GET, "/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["monitor"]["running"], false);
    }

    #[tokio::test]
    async fn test_status_reflects_latest_check() {
        let f = fixture();
        let response = send(&f.state, Method::POST, "/check", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["total"], 2);

        let body = body_json(send(&f.state, Method::GET, "/status", None, None).await).await;
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["available"], 1);
        assert_eq!(body["summary"]["unavailable"], 1);

        let categories = body_json(send(&f.state, Method::GET, "/categories", None, None).await).await;
        assert_eq!(
            categories,
            json!([{ "category": "finance", "datasets": 1 }, { "category": "weather", "datasets": 1 }])
        );
    }

    #[tokio::test]
    async fn test_versioned_api_requires_key() {
        let f = fixture();
        let response = send(&f.state, Method::GET, "/api/v1/status", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid_api_key");

        let response = send(&f.state, Method::GET, "/api/v1/status", Some("sk_nope"), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_free_key_admitted_with_headers_and_restricted() {
        let f = fixture();
        let secret = issue(&f.state, crate::db::Tier::Free);

        let response = send(&f.state, Method::GET, "/api/v1/status", Some(&secret), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit-hour"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining-hour"], "99");

        let response = send(&f.state, Method::GET, "/api/v1/analytics/timeline", Some(&secret), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "endpoint_not_allowed");

        let pro = issue(&f.state, crate::db::Tier::Pro);
        let response = send(&f.state, Method::GET, "/api/v1/analytics/timeline", Some(&pro), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let mut config = ServerConfig::default();
        config.free.per_hour = 1;
        let f = fixture_with(config);
        let secret = issue(&f.state, crate::db::Tier::Free);

        let first = send(&f.state, Method::GET, "/api/v1/health", Some(&secret), None).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-remaining-hour"], "0");

        let second = send(&f.state, Method::GET, "/api/v1/health", Some(&secret), None).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["x-ratelimit-limit-hour"], "1");
        let body = body_json(second).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["rate_limit"]["hour_remaining"], 0);
    }

    #[tokio::test]
    async fn test_developer_keys_act_only_on_themselves() {
        let f = fixture();
        let response = send(
            &f.state,
            Method::POST,
            "/developer/keys",
            None,
            Some(json!({ "name": "app", "email": "me@example.com" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let secret = body["key"]["secret"].as_str().unwrap().to_string();
        let key_id = body["key"]["key_id"].as_str().unwrap().to_string();
        assert_eq!(body["key"]["tier"], "free");
        assert!(body["key"].get("key_hash").is_none());

        let own = send(&f.state, Method::GET, &format!("/developer/keys/{}/stats", key_id), Some(&secret), None).await;
        assert_eq!(own.status(), StatusCode::OK);

        let other = issue(&f.state, crate::db::Tier::Free);
        let foreign = send(&f.state, Method::GET, &format!("/developer/keys/{}/stats", key_id), Some(&other), None).await;
        assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

        let response = send(
            &f.state,
            Method::POST,
            &format!("/developer/keys/{}/deactivate", key_id),
            Some(&secret),
            None,
        )
        .await;
        assert_eq!(body_json(response).await["deactivated"], true);
        let response = send(&f.state, Method::GET, "/api/v1/status", Some(&secret), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_generate_key_validates_input() {
        let f = fixture();
        let response = send(
            &f.state,
            Method::POST,
            "/developer/keys",
            None,
            Some(json!({ "name": " ", "email": "me@example.com" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &f.state,
            Method::POST,
            "/developer/keys",
            None,
            Some(json!({ "name": "app", "email": "me@example.com", "tier": "platinum" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_resources_are_not_found() {
        let f = fixture();
        let response = send(&f.state, Method::POST, "/api/notifications/42/read", None, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&f.state, Method::GET, "/api/analytics/dataset/missing", None, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notifications_lifecycle() {
        let f = fixture();
        let published = f.state.hub.system(crate::notification::NotificationKind::Info, "Hello", "world");

        let body = body_json(send(&f.state, Method::GET, "/api/notifications?limit=5", None, None).await).await;
        assert_eq!(body["unread_count"], 1);
        assert_eq!(body["notifications"][0]["title"], "Hello");

        let uri = format!("/api/notifications/{}/read", published.id);
        let response = send(&f.state, Method::POST, &uri, None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.state.hub.unread_count(), 0);

        send(&f.state, Method::POST, "/api/notifications/clear", None, None).await;
        assert_eq!(f.state.hub.len(), 0);
    }

    #[tokio::test]
    async fn test_oversized_windows_are_clamped() {
        let f = fixture();
        send(&f.state, Method::POST, "/check", None, None).await;

        for uri in [
            "/stats?hours=100000000000",
            "/datasets/alpha/history?hours=100000000000",
            "/api/analytics/categories?hours=100000000000",
            "/api/analytics/timeline?hours=100000000000&interval=9223372036854775807",
            "/api/analytics/datasets/top?hours=-9223372036854775808",
        ] {
            let response = send(&f.state, Method::GET, uri, None, None).await;
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        }

        let body = body_json(send(&f.state, Method::GET, "/api/analytics/metrics?hours=100000000000", None, None).await).await;
        assert_eq!(body["window_hours"], crate::analytics::MAX_WINDOW_HOURS);

        let body = body_json(send(&f.state, Method::GET, "/api/analytics/dataset/alpha?days=100000000000", None, None).await).await;
        assert_eq!(body["total_checks"], 1);
    }

    #[tokio::test]
    async fn test_owner_routes_consume_quota() {
        let mut config = ServerConfig::default();
        config.free.per_hour = 2;
        let f = fixture_with(config);
        let issued = f.state.gate.generate_key("app", "me@example.com", crate::db::Tier::Free, "").unwrap();
        let uri = format!("/developer/keys/{}/stats", issued.key.key_id);

        for remaining in ["1", "0"] {
            let response = send(&f.state, Method::GET, &uri, Some(&issued.secret), None).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-remaining-hour"], remaining);
        }
        let response = send(&f.state, Method::GET, &uri, Some(&issued.secret), None).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let stats = f.state.gate.key_stats(&issued.key.key_id, 1).unwrap();
        assert_eq!(stats.total_requests, 3);
        assert!(stats.status_codes.iter().any(|c| c.status_code == Some(200) && c.count == 2));
    }

    #[tokio::test]
    async fn test_list_keys_shows_callers_own_keys() {
        let f = fixture();
        let secret = issue(&f.state, crate::db::Tier::Free);
        issue(&f.state, crate::db::Tier::Pro);
        f.state.gate.generate_key("other", "other@example.com", crate::db::Tier::Free, "").unwrap();

        let response = send(&f.state, Method::GET, "/developer/keys", Some(&secret), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let keys = body["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k["user_email"] == "dev@example.com" && k.get("key_hash").is_none()));

        let response = send(&f.state, Method::GET, "/developer/keys", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_identifies_optional_key() {
        let f = fixture();
        let body = body_json(send(&f.state, Method::GET, "/health", None, None).await).await;
        assert!(body["api_key"].is_null());

        let secret = issue(&f.state, crate::db::Tier::Pro);
        let body = body_json(send(&f.state, Method::GET, "/health", Some(&secret), None).await).await;
        assert_eq!(body["api_key"]["tier"], "pro");

        // An invalid key on a public route is ignored, not rejected.
        let response = send(&f.state, Method::GET, "/health", Some("sk_nope"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["api_key"].is_null());
    }

    #[tokio::test]
    async fn test_latest_status_for_one_dataset() {
        let f = fixture();
        send(&f.state, Method::POST, "/check", None, None).await;

        let response = send(&f.state, Method::GET, "/datasets/beta", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "down");

        let response = send(&f.state, Method::GET, "/datasets/missing", None, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_cache_and_scheduler() {
        let f = fixture();
        send(&f.state, Method::GET, "/status", None, None).await;

        let stats = body_json(send(&f.state, Method::GET, "/admin/cache/stats", None, None).await).await;
        assert_eq!(stats["total_entries"], 1);
        assert_eq!(stats["valid_entries"], 1);

        let response = send(&f.state, Method::DELETE, "/admin/cache", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.state.cache.stats().total_entries, 0);

        let scheduler = body_json(send(&f.state, Method::GET, "/admin/scheduler", None, None).await).await;
        assert_eq!(scheduler["running"], false);
        assert_eq!(scheduler["check_interval_secs"], 300);
    }
}
