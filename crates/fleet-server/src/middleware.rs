//! Authentication middleware for node-agent inbound routes.
//!
//! Extracts the `X-Fleet-Host-Token` header and injects it into the request
//! extensions for `register`/`heartbeat` handlers to validate themselves —
//! `register` checks it as a bootstrap token, `heartbeat` as a session
//! token, since both schemes share the same header but mean different
//! things on different routes. Every other route (operator API, `/healthz`,
//! `/metrics`, `/ui`) is skipped here entirely.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// The raw bearer token presented by a node agent, injected into request
/// extensions for the handler to validate against the scheme it expects.
#[derive(Debug, Clone)]
pub struct HostToken(pub String);

/// Middleware that requires an `X-Fleet-Host-Token` header on node-agent
/// inbound routes (`/v1/hosts/{id}/register`, `/v1/hosts/{id}/heartbeat`)
/// and lets everything else through untouched.
pub async fn auth_middleware(State(_state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();

    let needs_host_token = path.starts_with("/v1/hosts/")
        && (path.ends_with("/register") || path.ends_with("/heartbeat"));

    if !needs_host_token {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("X-Fleet-Host-Token")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "unauthorized",
                "message": "missing X-Fleet-Host-Token header",
            })),
        )
            .into_response();
    };

    req.extensions_mut().insert(HostToken(token));
    next.run(req).await
}
