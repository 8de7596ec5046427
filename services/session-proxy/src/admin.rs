//! Admin API for credential management
//!
//! Runs on a separate listener (only when `[admin]` is configured) and is not
//! meant to be exposed publicly.
//!
//! Endpoints:
//! - GET    /admin/pool                      pool health with per-identity status
//! - GET    /admin/credentials               identifiers in rotation order
//! - POST   /admin/credentials               add a credential set to the rotation
//! - DELETE /admin/credentials/{identifier}  drop an identity from the rotation

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use common::Secret;
use serde::Deserialize;
use tracing::{info, warn};
use ubi_auth::CredentialSet;
use ubi_pool::AuthorizationProvider;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    provider: Arc<AuthorizationProvider>,
}

impl AdminState {
    pub fn new(provider: Arc<AuthorizationProvider>) -> Self {
        Self { provider }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route(
            "/admin/credentials",
            get(list_credentials).post(add_credentials),
        )
        .route("/admin/credentials/{identifier}", delete(remove_credentials))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> axum::response::Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/pool. Never exposes secrets or tickets.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.provider.health())
}

/// GET /admin/credentials
async fn list_credentials(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "identifiers": state.provider.identifiers() }),
    )
}

/// Request body for adding credentials.
#[derive(Debug, Deserialize)]
struct AddCredentialsRequest {
    identifier: String,
    secret: Secret<String>,
}

/// POST /admin/credentials. The first login runs in the background, so this
/// answers 202 and the identity shows up as `pending` in `/admin/pool` until
/// it is primed.
async fn add_credentials(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddCredentialsRequest>,
) -> impl IntoResponse {
    let credentials = match CredentialSet::new(body.identifier, body.secret) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "rejected credentials from admin API");
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": e.to_string() }),
            );
        }
    };

    let identifier = credentials.identifier().to_string();
    state.provider.add(credentials);
    info!(identifier, "credentials added through admin API");

    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({
            "identifier": identifier,
            "status": "pending",
        }),
    )
}

/// DELETE /admin/credentials/{identifier}
async fn remove_credentials(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> impl IntoResponse {
    if state.provider.remove(&identifier) {
        info!(identifier, "credentials removed through admin API");
        StatusCode::NO_CONTENT.into_response()
    } else {
        json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("no credentials for {identifier}") }),
        )
    }
}
