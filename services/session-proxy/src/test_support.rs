//! Loopback session service and upstream for service tests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use tokio::net::TcpListener;
use transport::ReqwestTransport;
use ubi_auth::{CredentialSet, IdentityToken, LoginEndpoint};
use ubi_pool::AuthorizationProvider;

/// Secret the loopback session service rejects with 401.
pub const REJECTED_SECRET: &str = "wrong";

/// Serve `app` on an ephemeral loopback port and return its base URL.
async fn serve(app: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

/// Session service that issues `ticket-<identifier>` valid for one hour.
///
/// Returns the full login URL.
pub async fn start_login_server() -> (String, tokio::task::JoinHandle<()>) {
    let app = axum::Router::new().route(
        "/v3/profiles/sessions",
        axum::routing::post(|headers: HeaderMap| async move {
            let credentials = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(IdentityToken::from_encoded)
                .and_then(|token| token.decode().ok());
            match credentials {
                Some(c) if c.secret().expose() != REJECTED_SECRET => {
                    let body = serde_json::json!({
                        "ticket": format!("ticket-{}", c.identifier()),
                        "expiration": (chrono::Utc::now() + chrono::TimeDelta::hours(1)).to_rfc3339(),
                        "profileId": "profile",
                    });
                    (StatusCode::OK, axum::Json(body))
                }
                _ => (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"message": "Invalid credentials"})),
                ),
            }
        }),
    );
    let (base, handle) = serve(app).await;
    (format!("{base}/v3/profiles/sessions"), handle)
}

/// Upstream that echoes method, path, query, headers and body as JSON.
pub async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
    let app = axum::Router::new().fallback(|request: Request<Body>| async move {
        let mut headers_map = serde_json::Map::new();
        for (name, value) in request.headers() {
            headers_map.insert(
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }
        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or("").to_string();
        let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap();
        let body = serde_json::json!({
            "echoed_headers": headers_map,
            "method": method,
            "path": path,
            "query": query,
            "body": String::from_utf8_lossy(&body_bytes),
        });
        (
            StatusCode::OK,
            [("x-upstream-echo", "true")],
            axum::Json(body),
        )
    });
    serve(app).await
}

/// Provider logging in against `login_url` over real HTTP. Not initialized.
pub fn provider_for(login_url: &str, credentials: Vec<CredentialSet>) -> Arc<AuthorizationProvider> {
    let transport = Arc::new(ReqwestTransport::new(reqwest::Client::new()));
    Arc::new(
        AuthorizationProvider::builder(transport)
            .credentials(credentials)
            .login_endpoint(LoginEndpoint::new(login_url))
            .build(),
    )
}
