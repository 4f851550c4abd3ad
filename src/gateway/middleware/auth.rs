// Authentication middleware
//
// Data plane: bearer token checked against the configured allow-list.
// Admin plane: `auth_token` cookie checked against the admin token.
// Rejections use the OpenAI-style error body on the data plane and a plain
// 401 on the admin plane.

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::gateway::handlers::AppState;

/// Pull the bearer token from the Authorization header (with or without the
/// "Bearer " prefix) or the x-api-key header.
fn extract_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        })
}

fn extract_cookie(request: &Request, name: &str) -> Option<String> {
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

fn unauthorized_json() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": 401,
                "message": "Invalid or missing access token"
            }
        })),
    )
        .into_response()
}

/// Data-plane auth: Authorization bearer token must be in ALLOWED_TOKENS
/// (the admin token is accepted as well).
pub async fn data_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let (allowed_tokens, auth_token) = {
        let settings = state.ctx.settings.read().await;
        (settings.allowed_tokens.clone(), settings.auth_token.clone())
    };

    if allowed_tokens.is_empty() && auth_token.is_empty() {
        warn!("[Auth] No allowed tokens configured, rejecting data-plane request");
        return unauthorized_json();
    }

    match extract_token(&request) {
        Some(token)
            if allowed_tokens.iter().any(|t| t == &token)
                || (!auth_token.is_empty() && token == auth_token) =>
        {
            next.run(request).await
        }
        Some(_) => {
            warn!("[Auth] Rejected request with unknown token: {}", request.uri().path());
            unauthorized_json()
        }
        None => unauthorized_json(),
    }
}

/// Admin-plane auth: the `auth_token` cookie must match the admin token.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let auth_token = state.ctx.settings.read().await.auth_token.clone();
    if auth_token.is_empty() {
        warn!("[Auth] Admin token not configured, rejecting admin request");
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Unauthorized"}))).into_response();
    }

    match extract_cookie(&request, "auth_token") {
        Some(cookie) if cookie == auth_token => next.run(request).await,
        _ => {
            warn!("[Auth] Unauthorized admin access to {}", request.uri().path());
            (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Unauthorized"}))).into_response()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
