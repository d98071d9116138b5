//! Cross-site WebSocket hijacking guard.
//!
//! Nothing in this server authenticates a client, so any page a user visits
//! could open a session stream from their browser. An upgrade that carries an
//! `Origin` must name a configured origin or the host it was sent to. Plain
//! HTTP is left to CORS, and clients that send no `Origin` at all (the CLI,
//! curl) are let through.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Arc<[String]>,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed: allowed.into(),
        }
    }

    /// Whether a request with these headers may proceed.
    pub fn admits(&self, headers: &HeaderMap) -> bool {
        let upgrade = header_str(headers, header::UPGRADE);
        if !upgrade.is_some_and(|u| u.eq_ignore_ascii_case("websocket")) {
            return true;
        }
        let Some(origin) = header_str(headers, header::ORIGIN) else {
            return true;
        };
        self.allowed.iter().any(|a| a == origin)
            || names_host(origin, header_str(headers, header::HOST))
    }
}

/// Middleware enforcing an [`OriginPolicy`]; refused upgrades get a 403.
pub async fn guard_upgrade(
    policy: OriginPolicy,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !policy.admits(req.headers()) {
        let origin = header_str(req.headers(), header::ORIGIN).unwrap_or_default();
        tracing::warn!(%origin, "rejected cross-origin websocket upgrade");
        return Err(ApiError::OriginNotAllowed);
    }
    Ok(next.run(req).await)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `origin` is `scheme://authority`; compare its authority with `Host`.
fn names_host(origin: &str, host: Option<&str>) -> bool {
    let authority = ["http://", "https://"]
        .iter()
        .find_map(|scheme| origin.strip_prefix(scheme));
    matches!((authority, host), (Some(a), Some(h)) if a.eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{HeaderValue, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn policy() -> OriginPolicy {
        OriginPolicy::new(vec!["http://localhost:5173".to_string()])
    }

    fn upgrade(origin: Option<&'static str>, host: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, HeaderValue::from_static(origin));
        }
        if let Some(host) = host {
            headers.insert(header::HOST, HeaderValue::from_static(host));
        }
        headers
    }

    #[test]
    fn upgrades_from_listed_or_same_host_origins_are_admitted() {
        let policy = policy();
        assert!(policy.admits(&upgrade(Some("http://localhost:5173"), Some("127.0.0.1:3001"))));
        assert!(policy.admits(&upgrade(Some("http://127.0.0.1:3001"), Some("127.0.0.1:3001"))));
        assert!(policy.admits(&upgrade(None, None)));
    }

    #[test]
    fn upgrades_from_foreign_origins_are_refused() {
        let policy = policy();
        assert!(!policy.admits(&upgrade(Some("http://evil.com"), Some("127.0.0.1:3001"))));
        assert!(!policy.admits(&upgrade(Some("http://evil.com"), None)));
        assert!(!OriginPolicy::default().admits(&upgrade(Some("null"), Some("null"))));
    }

    #[test]
    fn plain_requests_are_not_checked() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.com"));
        assert!(OriginPolicy::default().admits(&headers));
    }

    #[test]
    fn host_comparison_uses_the_whole_authority() {
        assert!(names_host("https://Example.com:8443", Some("example.com:8443")));
        assert!(!names_host("http://example.com", Some("example.com:3001")));
        assert!(!names_host("http://example.com", None));
        assert!(!names_host("ftp://example.com", Some("example.com")));
    }

    #[tokio::test]
    async fn refused_upgrade_is_forbidden_and_never_reaches_the_route() {
        let policy = policy();
        let app = Router::new()
            .route("/stream", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(move |req, next| {
                guard_upgrade(policy.clone(), req, next)
            }));
        let send = |origin: &'static str| {
            let app = app.clone();
            async move {
                let req = axum::http::Request::builder()
                    .uri("/stream")
                    .header(header::UPGRADE, "websocket")
                    .header(header::ORIGIN, origin)
                    .header(header::HOST, "127.0.0.1:3001")
                    .body(Body::empty())
                    .unwrap();
                app.oneshot(req).await.unwrap().status()
            }
        };
        assert_eq!(send("http://evil.com").await, StatusCode::FORBIDDEN);
        assert_eq!(send("http://localhost:5173").await, StatusCode::OK);
    }
}
