//! HTTP API served on the bare domain: tunnel creation, status, metrics.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::ferry::{
    telemetry,
    tunnel::registry::{ClientRegistry, Registration, RegistryError},
};

const INVALID_ID: &str = "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ClientRegistry>,
    pub metrics: Option<telemetry::SharedPrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/metrics", get(metrics))
        .route("/api/status", get(status))
        .route("/api/tunnels", post(create_tunnel))
        .route("/api/tunnels/{id}", delete(delete_tunnel))
        .route("/api/tunnels/{id}/status", get(tunnel_status))
        .fallback(not_found)
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "All systems are operational.")
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found.")
}

async fn metrics(State(st): State<Arc<ApiState>>) -> Response {
    match &st.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => not_found().await.into_response(),
    }
}

async fn status(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(st.registry.stats())
}

async fn tunnel_status(
    State(st): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match st.registry.lookup_by_id(&id) {
        Ok(client) => Json(client.stats()).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn delete_tunnel(State(st): State<Arc<ApiState>>, Path(id): Path<String>) -> StatusCode {
    if !st.registry.has_id(&id) {
        return StatusCode::NOT_FOUND;
    }
    st.registry.remove(&id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Created {
    #[serde(flatten)]
    registration: Registration,
    url: String,
}

async fn create_tunnel(
    State(st): State<Arc<ApiState>>,
    Query(q): Query<CreateQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = q.client_id.filter(|id| is_valid_id(id)) else {
        return (StatusCode::BAD_REQUEST, INVALID_ID).into_response();
    };
    if st.registry.has_id(&id) {
        return (StatusCode::FORBIDDEN, format!("Client \"{id}\" already exists.")).into_response();
    }

    match st.registry.register(&id, &new_secret(), None) {
        Ok(registration) => {
            let url = format!("{id}.{}", request_hostname(&headers));
            Json(Created { registration, url }).into_response()
        }
        Err(RegistryError::DuplicateId(_)) => {
            (StatusCode::FORBIDDEN, format!("Client \"{id}\" already exists.")).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// `^[a-z0-9_]{4,63}$`
fn is_valid_id(id: &str) -> bool {
    (4..=63).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// 32 random bytes, hex encoded.
fn new_secret() -> String {
    let bytes: [u8; 32] = rng().random();
    hex::encode(bytes)
}

fn request_hostname(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    host.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::ferry::tunnel::client::GracePeriod;

    fn app() -> (Router, Arc<ClientRegistry>) {
        let registry = Arc::new(ClientRegistry::new(10, GracePeriod::Disabled));
        let app = router(ApiState {
            registry: registry.clone(),
            metrics: None,
        });
        (app, registry)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "example.com:8080")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn id_validation() {
        assert!(is_valid_id("abcd"));
        assert!(is_valid_id("my_app_01"));
        assert!(!is_valid_id("abc"));
        assert!(!is_valid_id("ABCD"));
        assert!(!is_valid_id("ab-cd"));
        assert!(!is_valid_id(&"a".repeat(64)));
        assert!(is_valid_id(&"a".repeat(63)));
    }

    #[test]
    fn secrets_are_hex_and_distinct() {
        let a = new_secret();
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, new_secret());
    }

    #[test]
    fn hostname_drops_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "Example.com:8080".parse().unwrap());
        assert_eq!(request_hostname(&headers), "example.com");
        headers.insert(header::HOST, "example.com".parse().unwrap());
        assert_eq!(request_hostname(&headers), "example.com");
        assert_eq!(request_hostname(&HeaderMap::new()), "localhost");
    }

    #[tokio::test]
    async fn health_and_fallback() {
        let (app, _) = app();
        assert_eq!(
            call(&app, "GET", "/").await,
            (StatusCode::OK, "All systems are operational.".to_string())
        );
        assert_eq!(
            call(&app, "GET", "/nowhere").await,
            (StatusCode::NOT_FOUND, "Not found.".to_string())
        );
    }

    #[tokio::test]
    async fn create_tunnel_flow() {
        let (app, registry) = app();

        let (status, body) = call(&app, "POST", "/api/tunnels?clientId=BAD").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, INVALID_ID);
        let (status, _) = call(&app, "POST", "/api/tunnels").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "POST", "/api/tunnels?clientId=abcd").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["id"], "abcd");
        assert_eq!(v["maxSockets"], 10);
        assert_eq!(v["url"], "abcd.example.com");
        let secret = v["secret"].as_str().unwrap();
        assert_eq!(secret.len(), 64);
        assert!(registry.has_secret(secret));

        let (status, body) = call(&app, "POST", "/api/tunnels?clientId=abcd").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Client \"abcd\" already exists.");

        let (status, body) = call(&app, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"tunnels":1}"#);
    }

    #[tokio::test]
    async fn tunnel_status_and_delete() {
        let (app, registry) = app();
        let (status, _) = call(&app, "GET", "/api/tunnels/abcd/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        registry.register("abcd", "s1", None).unwrap();
        let (status, body) = call(&app, "GET", "/api/tunnels/abcd/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"connectedSockets":0}"#);

        let (status, _) = call(&app, "DELETE", "/api/tunnels/abcd").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!registry.has_id("abcd"));
        let (status, _) = call(&app, "DELETE", "/api/tunnels/abcd").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
