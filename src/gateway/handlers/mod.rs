// Handlers module - data-plane and admin endpoint processors

pub mod admin;
pub mod openai;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::gateway::provider_service::ProviderService;
use crate::AppContext;

/// Shared application state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

/// Resolve the target provider: no segment means the default provider, a
/// segment is matched by name first and then by path; unknown segments are
/// a 404.
pub async fn resolve_service(
    state: &AppState,
    provider: Option<&str>,
) -> Result<Arc<ProviderService>, Response> {
    match provider {
        None | Some("") => state.ctx.registry.default_service().await.ok_or_else(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": {
                        "code": 503,
                        "message": "Default provider not available"
                    }
                })),
            )
                .into_response()
        }),
        Some(segment) => {
            if let Some(service) = state.ctx.registry.get(segment).await {
                return Ok(service);
            }
            if let Some(service) = state.ctx.registry.get_by_path(segment).await {
                return Ok(service);
            }
            Err((
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": {
                        "code": 404,
                        "message": format!("Provider '{}' not found", segment)
                    }
                })),
            )
                .into_response())
        }
    }
}
