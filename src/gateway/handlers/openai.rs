// OpenAI-compatible data plane - /v1/models, /v1/chat/completions,
// /v1/embeddings (plus /:provider and cosmetic /openai, /hf variants)
//
// The stream handler peeks the first produced line to classify the response:
// an error before any line becomes a JSON error with the upstream status, a
// line starting with "data:" begins a text/event-stream response, anything
// else is passed through as a degenerate JSON response.

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use super::{resolve_service, AppState};
use crate::gateway::error::UpstreamError;
use crate::models::openai::{ChatRequest, EmbeddingRequest};

fn error_response(e: &UpstreamError) -> Response {
    let status =
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(e.to_error_body())).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": {"code": 400, "message": message}
        })),
    )
        .into_response()
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap()
}

// ============================================================================
// Models
// ============================================================================

pub async fn handle_list_models(
    State(state): State<AppState>,
    provider: Option<Path<String>>,
) -> Response {
    let provider = provider.map(|Path(p)| p);
    let service = match resolve_service(&state, provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    info!("[{}] Handling models list request", service.config().name);
    match service.get_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Chat completions
// ============================================================================

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    provider: Option<Path<String>>,
    Json(body): Json<Value>,
) -> Response {
    let request: ChatRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("Invalid request: {}", e)),
    };

    let provider = provider.map(|Path(p)| p);
    let service = match resolve_service(&state, provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    info!(
        "[{}] Chat completion request - Model: {}, stream: {}",
        service.config().name,
        request.model,
        request.stream
    );

    if !service.is_model_supported(&request.model) {
        return bad_request(format!("Model {} is not supported", request.model));
    }

    if !request.stream {
        return match service.chat_completion(&request, None).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_response(&e),
        };
    }

    // Streaming: peek the first line to decide between SSE and a JSON error
    let stream = service.chat_completion_stream(&request);
    let mut stream = Box::pin(stream);

    match stream.next().await {
        None => sse_response(Body::empty()),
        Some(Err(e)) => error_response(&e),
        Some(Ok(first)) if first.starts_with("data:") => {
            let body = Body::from_stream(
                futures::stream::once(async move { Ok::<_, UpstreamError>(first) }).chain(stream),
            );
            sse_response(body)
        }
        Some(Ok(first)) => {
            // Upstream answered 2xx with a non-SSE body; pass it through
            debug!("Degenerate stream response, passing object through");
            match serde_json::from_str::<Value>(first.trim()) {
                Ok(value) => Json(value).into_response(),
                Err(_) => first.into_response(),
            }
        }
    }
}

// ============================================================================
// Embeddings
// ============================================================================

pub async fn handle_embeddings(
    State(state): State<AppState>,
    provider: Option<Path<String>>,
    Json(body): Json<Value>,
) -> Response {
    let request: EmbeddingRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("Invalid request: {}", e)),
    };

    let provider = provider.map(|Path(p)| p);
    let service = match resolve_service(&state, provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    info!(
        "[{}] Embedding request - Model: {}",
        service.config().name,
        request.model
    );
    match service.create_embeddings(&request, None).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}
