pub mod error;
mod handlers;
pub mod origin;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Request body limit for every route.
const BODY_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
}

pub(crate) fn get_session(
    sessions: &SessionRegistry,
    id: &str,
) -> Result<crate::session::Session, error::ApiError> {
    sessions
        .get(id)
        .ok_or_else(|| error::ApiError::SessionNotFound(id.to_string()))
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without CORS.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Browser origins allowed for CORS and WebSocket upgrades.
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let session_routes = Router::new()
        .route("/", get(session_list).post(session_create))
        .route("/opened/all", get(sessions_opened))
        .route("/{id}", get(session_get).delete(session_delete))
        .route("/{id}/stop", post(session_stop))
        .route("/{id}/resize", post(session_resize))
        .route("/{id}/scrollback", get(session_scrollback))
        .route("/{id}/input", post(session_input))
        .route("/{id}/stream", get(session_stream));

    let policy = origin::OriginPolicy::new(config.cors_origins.clone());
    let api = Router::new()
        .nest("/api/sessions", session_routes)
        .layer(axum::middleware::from_fn(move |req, next| {
            origin::guard_upgrade(policy.clone(), req, next)
        }));

    let router = Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .merge(api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::project::MarkerProjects;
    use crate::pty::NativeSpawner;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt; // for oneshot()

    fn app() -> Router {
        let sessions = SessionRegistry::new(
            Arc::new(NativeSpawner::default()),
            Arc::new(MarkerProjects::default()),
            SessionConfig::default(),
        );
        router(
            AppState {
                sessions,
                shutdown: ShutdownCoordinator::new(),
            },
            RouterConfig::default(),
        )
    }

    async fn send(req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_sets_security_headers() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["referrer-policy"], "no-referrer");
    }

    #[tokio::test]
    async fn readyz_without_selftest_is_ok() {
        let (status, json) = send(Request::get("/readyz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn empty_list() {
        let (status, json) = send(Request::get("/api/sessions").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        for (method, uri) in [
            ("GET", "/api/sessions/nope"),
            ("POST", "/api/sessions/nope/stop"),
            ("DELETE", "/api/sessions/nope"),
            ("GET", "/api/sessions/nope/scrollback"),
        ] {
            let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
            let (status, json) = send(req).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            assert_eq!(json["error"]["code"], "session_not_found");
        }
    }

    #[tokio::test]
    async fn malformed_create_body_is_invalid_request() {
        let req = Request::post("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cwd":"/tmp","command":"bash"}"#))
            .unwrap();
        let (status, json) = send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn create_outside_a_project_is_invalid_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({ "cwd": dir.path() }).to_string();
        let req = Request::post("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let (status, json) = send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_cwd");
    }
}
