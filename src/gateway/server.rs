// Gateway server - route assembly, middleware stack, and server lifecycle
//
// Data-plane routes are mounted at the root and under the cosmetic /openai
// and /hf prefixes; provider-scoped variants use a path segment resolved by
// name or configured path. Admin routes sit behind the cookie middleware.

use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info};

use crate::gateway::handlers::{admin, openai, AppState};
use crate::gateway::middleware::{admin_auth_middleware, cors_layer, data_auth_middleware};

async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

// ============================================================================
// Route builders
// ============================================================================

/// OpenAI-compatible data-plane routes, bearer-authenticated.
fn data_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(openai::handle_list_models))
        .route("/v1/chat/completions", post(openai::handle_chat_completions))
        .route("/v1/embeddings", post(openai::handle_embeddings))
        // Provider-scoped variants: /:provider resolved by name, then path
        .route("/:provider/v1/models", get(openai::handle_list_models))
        .route(
            "/:provider/v1/chat/completions",
            post(openai::handle_chat_completions),
        )
        .route("/:provider/v1/embeddings", post(openai::handle_embeddings))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            data_auth_middleware,
        ))
        .with_state(state)
}

/// Admin routes, cookie-authenticated.
fn admin_routes(state: AppState) -> Router {
    Router::new()
        // Key management
        .route("/api/keys", get(admin::get_keys_paginated))
        .route("/api/keys/all", get(admin::get_all_keys))
        .route("/api/keys/providers", get(admin::get_keys_by_provider))
        .route("/api/keys/stats", get(admin::get_keys_stats))
        .route("/api/keys/verify-batch", post(admin::verify_keys_batch))
        .route("/api/keys/verify/*key", post(admin::verify_key))
        .route("/api/keys/reset-fail-count/*key", post(admin::reset_key_fail_count))
        // Providers
        .route("/v1/keys/list", get(admin::get_keys_list))
        .route("/v1/providers", get(admin::list_providers))
        .route("/v1/providers/status", get(admin::providers_status))
        // Proxy pool
        .route("/api/proxies", get(admin::get_proxy_status))
        .route("/api/proxies/check", post(admin::trigger_proxy_check))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    let data = data_routes(state.clone());
    let admin = admin_routes(state);

    let max_body_size: usize = std::env::var("BALANCE_GATEWAY_MAX_BODY_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100 * 1024 * 1024);

    Router::new()
        .route("/health", get(health_check_handler))
        .merge(data.clone())
        // Cosmetic prefixes consumed before provider resolution
        .nest("/openai", data.clone())
        .nest("/hf", data)
        .merge(admin)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(max_body_size))
}

// ============================================================================
// GatewayServer - lifecycle
// ============================================================================

#[derive(Clone)]
pub struct GatewayServer {
    shutdown_tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<()>>>>,
    pub local_addr: std::net::SocketAddr,
    pub is_running: Arc<RwLock<bool>>,
}

impl GatewayServer {
    /// Bind and start serving. Returns the server handle and the accept-loop
    /// task; a bind failure is an error the caller turns into a non-zero
    /// exit.
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = build_router(state);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local addr: {}", e))?;

        info!("Gateway server started at http://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let is_running = Arc::new(RwLock::new(true));

        let server = Self {
            shutdown_tx: Arc::new(tokio::sync::Mutex::new(Some(shutdown_tx))),
            local_addr,
            is_running: is_running.clone(),
        };

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            let app_service = app.into_service();

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, remote_addr)) => {
                                let io = TokioIo::new(stream);

                                use hyper::body::Incoming;
                                use tower::ServiceExt;
                                let svc = app_service.clone().map_request(
                                    move |mut req: axum::http::Request<Incoming>| {
                                        req.extensions_mut().insert(
                                            axum::extract::ConnectInfo(remote_addr),
                                        );
                                        req
                                    },
                                );
                                let hyper_svc = TowerToHyperService::new(svc);

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, hyper_svc)
                                        .with_upgrades()
                                        .await
                                    {
                                        debug!("Connection ended: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept connection failed: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Gateway server shutting down");
                        *is_running.write().await = false;
                        break;
                    }
                }
            }
        });

        Ok((server, handle))
    }

    /// Send the stop signal.
    pub fn stop(&self) {
        let tx_mutex = self.shutdown_tx.clone();
        tokio::spawn(async move {
            let mut lock = tx_mutex.lock().await;
            if let Some(tx) = lock.take() {
                let _ = tx.send(());
                info!("Gateway server stop signal sent");
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
