// Admin handlers - key inspection, verification, and proxy pool management
//
// All routes here sit behind the admin cookie middleware. Key verification
// threads the numeric upstream status outward instead of parsing error
// strings.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::gateway::provider_service::ProviderService;
use crate::gateway::scheduler;

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    10
}

fn default_status() -> String {
    "all".to_string()
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub search: Option<String>,
    pub fail_count_threshold: Option<u32>,
    #[serde(default = "default_status")]
    pub status: String,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBatchRequest {
    #[serde(default)]
    pub keys: Vec<String>,
    pub provider: Option<String>,
}

/// Resolve the admin-side target service: no provider (or "default"/"all")
/// means the default provider.
async fn admin_service(
    state: &AppState,
    provider: Option<&str>,
) -> Result<Arc<ProviderService>, Response> {
    let target = match provider {
        None | Some("") | Some("default") | Some("all") => {
            return state.ctx.registry.default_service().await.ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"success": false, "error": "Default provider not available"})),
                )
                    .into_response()
            });
        }
        Some(name) => name,
    };

    state.ctx.registry.get(target).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("Provider '{}' not found", target)
            })),
        )
            .into_response()
    })
}

// ============================================================================
// Key listing
// ============================================================================

/// GET /api/keys - paginated, filtered key listing with per-key provider tag.
pub async fn get_keys_paginated(
    State(state): State<AppState>,
    Query(query): Query<KeysQuery>,
) -> Response {
    // (key, fail_count, provider) in registry order
    let mut keys_info: Vec<(String, u32, String)> = Vec::new();

    let services = match &query.provider {
        None => state.ctx.registry.all().await,
        Some(p) if p == "all" => state.ctx.registry.all().await,
        Some(p) => match admin_service(&state, Some(p)).await {
            Ok(service) => vec![service],
            Err(response) => return response,
        },
    };

    for service in services {
        let provider = service.config().name.clone();
        let snapshot = service.key_manager().all_keys_with_fail_count();
        let selected: Vec<(&String, &u32)> = match query.status.as_str() {
            "valid" => snapshot.valid_keys.iter().collect(),
            "invalid" => snapshot.invalid_keys.iter().collect(),
            _ => snapshot.all_keys.iter().collect(),
        };
        for (key, count) in selected {
            keys_info.push((key.clone(), *count, provider.clone()));
        }
    }

    if let Some(search) = &query.search {
        let needle = search.to_lowercase();
        keys_info.retain(|(key, _, _)| key.to_lowercase().contains(&needle));
    }
    if let Some(threshold) = query.fail_count_threshold {
        keys_info.retain(|(_, count, _)| *count >= threshold);
    }
    keys_info.sort_by(|a, b| a.0.cmp(&b.0));

    let limit = query.limit.max(1);
    let total_items = keys_info.len();
    let total_pages = if total_items > 0 {
        (total_items + limit - 1) / limit
    } else {
        1
    };
    let page = query.page.max(1);
    let start = (page - 1) * limit;

    let mut keys = Map::new();
    let mut info = Map::new();
    for (key, count, provider) in keys_info.into_iter().skip(start).take(limit) {
        keys.insert(key.clone(), json!(count));
        info.insert(key, json!({"fail_count": count, "provider": provider}));
    }

    Json(json!({
        "keys": keys,
        "keys_info": info,
        "total_items": total_items,
        "total_pages": total_pages,
        "current_page": page,
        "provider": query.provider.as_deref().unwrap_or("all"),
    }))
    .into_response()
}

/// GET /api/keys/all - raw valid/invalid key lists for bulk operations.
pub async fn get_all_keys(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Response {
    let service = match admin_service(&state, query.provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    let snapshot = service.key_manager().all_keys_with_fail_count();
    let mut valid_keys: Vec<String> = snapshot.valid_keys.keys().cloned().collect();
    let mut invalid_keys: Vec<String> = snapshot.invalid_keys.keys().cloned().collect();
    valid_keys.sort();
    invalid_keys.sort();

    Json(json!({
        "total_count": valid_keys.len() + invalid_keys.len(),
        "valid_keys": valid_keys,
        "invalid_keys": invalid_keys,
    }))
    .into_response()
}

/// GET /v1/keys/list - valid/invalid keys with fail counts.
pub async fn get_keys_list(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Response {
    let service = match admin_service(&state, query.provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    let snapshot = service.key_manager().all_keys_with_fail_count();
    Json(json!({
        "status": "success",
        "data": {
            "valid_keys": snapshot.valid_keys,
            "invalid_keys": snapshot.invalid_keys,
        },
        "total": snapshot.all_keys.len(),
    }))
    .into_response()
}

/// GET /api/keys/providers - key status grouped by provider.
pub async fn get_keys_by_provider(State(state): State<AppState>) -> Response {
    let mut providers = Map::new();
    for entry in state.ctx.registry.status().await {
        providers.insert(
            entry.name.clone(),
            serde_json::to_value(&entry).unwrap_or(Value::Null),
        );
    }
    Json(json!({ "providers": providers })).into_response()
}

/// GET /api/keys/stats - aggregate key counts across providers.
pub async fn get_keys_stats(State(state): State<AppState>) -> Response {
    let status = state.ctx.registry.status().await;
    let mut total_keys = 0usize;
    let mut total_valid = 0usize;
    let mut total_invalid = 0usize;
    let mut providers = Map::new();

    for entry in &status {
        total_keys += entry.total_keys;
        total_valid += entry.valid_keys_count;
        total_invalid += entry.invalid_keys_count;
        providers.insert(
            entry.name.clone(),
            json!({
                "total": entry.total_keys,
                "valid": entry.valid_keys_count,
                "invalid": entry.invalid_keys_count,
            }),
        );
    }

    Json(json!({
        "total_keys": total_keys,
        "valid_keys": total_valid,
        "invalid_keys": total_invalid,
        "providers": providers,
    }))
    .into_response()
}

// ============================================================================
// Key verification
// ============================================================================

/// POST /api/keys/verify/*key - probe a single key; success resets its
/// failure count.
pub async fn verify_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Response {
    let service = match admin_service(&state, query.provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    match service.verify_key(&key).await {
        Ok(()) => {
            info!("[Admin] Key verification successful, failure count reset");
            Json(json!({
                "success": true,
                "status": "valid",
                "message": "Key verified successfully"
            }))
            .into_response()
        }
        Err(e) => Json(json!({
            "success": false,
            "status": "invalid",
            "error": e.message(),
            "error_code": e.status(),
        }))
        .into_response(),
    }
}

/// POST /api/keys/verify-batch - probe a list of keys; numeric error codes
/// come straight from the upstream error.
pub async fn verify_keys_batch(
    State(state): State<AppState>,
    Json(request): Json<VerifyBatchRequest>,
) -> Response {
    if request.keys.is_empty() {
        return Json(json!({
            "successful_keys": [],
            "failed_keys": {},
            "valid_count": 0,
            "invalid_count": 0,
        }))
        .into_response();
    }

    let service = match admin_service(&state, request.provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    let mut successful_keys = Vec::new();
    let mut failed_keys = Map::new();
    for key in &request.keys {
        match service.verify_key(key).await {
            Ok(()) => successful_keys.push(key.clone()),
            Err(e) => {
                failed_keys.insert(
                    key.clone(),
                    json!({
                        "error_code": e.status(),
                        "error_message": e.message(),
                    }),
                );
            }
        }
    }

    Json(json!({
        "valid_count": successful_keys.len(),
        "invalid_count": failed_keys.len(),
        "successful_keys": successful_keys,
        "failed_keys": failed_keys,
    }))
    .into_response()
}

/// POST /api/keys/reset-fail-count/*key
pub async fn reset_key_fail_count(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Response {
    let service = match admin_service(&state, query.provider.as_deref()).await {
        Ok(service) => service,
        Err(response) => return response,
    };

    if service.key_manager().reset_key_failure_count(&key) {
        Json(json!({"success": true, "message": "Failure count reset"})).into_response()
    } else {
        Json(json!({"success": false, "message": "Key not found"})).into_response()
    }
}

// ============================================================================
// Providers
// ============================================================================

/// GET /v1/providers - registered providers and the default selection.
pub async fn list_providers(State(state): State<AppState>) -> Response {
    let services = state.ctx.registry.all().await;
    let providers: Vec<Value> = services
        .iter()
        .map(|service| {
            let config = service.config();
            json!({
                "name": config.name,
                "path": config.path,
                "base_url": config.base_url,
                "total_keys": config.api_keys.len(),
                "enabled": config.enabled,
            })
        })
        .collect();

    Json(json!({
        "providers": providers,
        "default_provider": state.ctx.registry.default_provider_name().await,
    }))
    .into_response()
}

/// GET /v1/providers/status - per-provider key status snapshots.
pub async fn providers_status(State(state): State<AppState>) -> Response {
    Json(json!({ "providers": state.ctx.registry.status().await })).into_response()
}

// ============================================================================
// Proxy pool
// ============================================================================

/// GET /api/proxies - proxy pool status.
pub async fn get_proxy_status(State(state): State<AppState>) -> Response {
    Json(serde_json::to_value(state.ctx.proxy_pool.status()).unwrap_or(Value::Null))
        .into_response()
}

/// POST /api/proxies/check - probe all proxies now, cache bypassed, and feed
/// the results back into the pool.
pub async fn trigger_proxy_check(State(state): State<AppState>) -> Response {
    let (check_url, check_timeout) = {
        let settings = state.ctx.settings.read().await;
        (settings.proxy_check_url.clone(), settings.proxy_check_timeout)
    };

    scheduler::check_proxies(
        &state.ctx.proxy_pool,
        &state.ctx.proxy_checker,
        &check_url,
        check_timeout,
    )
    .await;

    Json(json!({
        "success": true,
        "status": state.ctx.proxy_pool.status(),
    }))
    .into_response()
}
