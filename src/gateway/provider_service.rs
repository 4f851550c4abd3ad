// Provider service - per-provider request orchestration
//
// Drafts the outbound payload, pulls keys from the key manager and proxies
// from the shared pool, drives the upstream client, and writes one request
// log per attempt plus one error log per failed attempt.
//
// Streaming retry contract: key rotation happens only while no byte has been
// delivered to the client. Errors before the first yielded line surface as
// stream errors the router can turn into a JSON error response; an error
// after the first yield terminates the stream without retrying, so the
// client never observes duplicated or reordered SSE lines.

use async_stream::try_stream;
use chrono::Utc;
use futures::{pin_mut, Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::gateway::error::UpstreamError;
use crate::gateway::key_manager::KeyManager;
use crate::gateway::logs::LogStore;
use crate::gateway::proxy_pool::ProxyManager;
use crate::gateway::upstream::client::UpstreamClient;
use crate::models::config::{redact_key, ProviderConfig};
use crate::models::openai::{ChatRequest, EmbeddingRequest};

pub struct ProviderService {
    config: ProviderConfig,
    key_manager: Arc<KeyManager>,
    proxy_pool: Arc<ProxyManager>,
    logs: Arc<LogStore>,
    client: UpstreamClient,
    record_request_body: bool,
}

impl ProviderService {
    pub fn new(
        config: ProviderConfig,
        key_manager: Arc<KeyManager>,
        proxy_pool: Arc<ProxyManager>,
        logs: Arc<LogStore>,
        record_request_body: bool,
    ) -> Self {
        let client = UpstreamClient::new(&config.base_url, config.timeout);
        Self {
            config,
            key_manager,
            proxy_pool,
            logs,
            client,
            record_request_body,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    fn request_msg(&self, payload: &Value) -> Option<Value> {
        self.record_request_body.then(|| payload.clone())
    }

    // ========================================================================
    // Models
    // ========================================================================

    /// GET the upstream model list, filtered by the provider's deny-list.
    /// Uses the dedicated model request key when configured.
    pub async fn get_models(&self) -> Result<Value, UpstreamError> {
        let api_key = if !self.config.model_request_key.is_empty() {
            self.config.model_request_key.clone()
        } else {
            self.key_manager.first_valid_key()
        };
        if api_key.is_empty() {
            return Err(UpstreamError::NoApiKey {
                provider: self.config.name.clone(),
            });
        }

        let proxy = self.proxy_pool.proxy_for_key(&api_key);
        let result = self
            .client
            .get_models(&api_key, proxy.as_deref(), &self.config.custom_headers)
            .await;

        match result {
            Ok(mut models) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_success(p);
                }
                if !self.config.filtered_models.is_empty() {
                    if let Some(data) = models.get_mut("data").and_then(|d| d.as_array_mut()) {
                        data.retain(|model| {
                            let id = model.get("id").and_then(|v| v.as_str()).unwrap_or("");
                            !self.config.filtered_models.iter().any(|f| f == id)
                        });
                    }
                }
                Ok(models)
            }
            Err(e) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_failure(p);
                }
                Err(e)
            }
        }
    }

    /// Whether the model is allowed (not on the deny-list).
    pub fn is_model_supported(&self, model: &str) -> bool {
        let model = model.trim();
        !model.is_empty() && !self.config.filtered_models.iter().any(|f| f == model)
    }

    // ========================================================================
    // Chat (non-stream)
    // ========================================================================

    /// Single-shot chat completion. No in-service retry: failures are logged
    /// and surfaced immediately.
    pub async fn chat_completion(
        &self,
        request: &ChatRequest,
        api_key: Option<String>,
    ) -> Result<Value, UpstreamError> {
        let api_key = match api_key {
            Some(key) if !key.is_empty() => key,
            _ => self.key_manager.next_working_key(),
        };
        if api_key.is_empty() {
            return Err(UpstreamError::NoApiKey {
                provider: self.config.name.clone(),
            });
        }

        let payload = request.to_payload();
        let start = Instant::now();
        let request_time = Utc::now();
        let proxy = self.proxy_pool.proxy_for_key(&api_key);

        let result = self
            .client
            .chat_completion(&payload, &api_key, proxy.as_deref(), &self.config.custom_headers)
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_success(p);
                }
                info!(
                    "[{}] Chat completion finished - Model: {}, Latency: {}ms",
                    self.config.name, request.model, latency_ms
                );
                self.logs.add_request_log(
                    &request.model,
                    &api_key,
                    true,
                    Some(200),
                    latency_ms,
                    request_time,
                );
                Ok(response)
            }
            Err(e) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_failure(p);
                }
                error!(
                    "[{}] Chat completion failed for model {}: {}",
                    self.config.name,
                    request.model,
                    e.message()
                );
                self.logs.add_error_log(
                    &api_key,
                    &request.model,
                    &format!("{}-chat-non-stream", self.config.name),
                    &e.message(),
                    e.status(),
                    self.request_msg(&payload),
                    request_time,
                );
                self.logs.add_request_log(
                    &request.model,
                    &api_key,
                    false,
                    Some(e.status()),
                    latency_ms,
                    request_time,
                );
                Err(e)
            }
        }
    }

    // ========================================================================
    // Chat (streaming)
    // ========================================================================

    /// Streaming chat completion with key rotation.
    ///
    /// Each non-empty upstream line is yielded with a trailing newline. A
    /// failed attempt before the first delivered line rotates to the next
    /// working key, up to the retry budget (`max_retries == 0` still allows
    /// one attempt); the last error then surfaces as the stream's error.
    pub fn chat_completion_stream(
        self: &Arc<Self>,
        request: &ChatRequest,
    ) -> impl Stream<Item = Result<String, UpstreamError>> + Send + 'static {
        let service = Arc::clone(self);
        let model = request.model.clone();
        let payload = request.to_payload();

        try_stream! {
            let mut current_key = service.key_manager.next_working_key();
            if current_key.is_empty() {
                let failed: Result<(), UpstreamError> = Err(UpstreamError::NoApiKey {
                    provider: service.config.name.clone(),
                });
                failed?;
            }

            let attempts = service.config.max_retries.max(1);
            let mut delivered = false;
            let mut fatal: Option<UpstreamError> = None;

            'attempts: for attempt in 0..attempts {
                let attempt_key = current_key.clone();
                let start = Instant::now();
                let request_time = Utc::now();
                let proxy = service.proxy_pool.proxy_for_key(&attempt_key);

                let open = service
                    .client
                    .chat_completion_stream(
                        &payload,
                        &attempt_key,
                        proxy.as_deref(),
                        &service.config.custom_headers,
                    )
                    .await;

                let attempt_error = match open {
                    Ok(stream) => {
                        if let Some(p) = &proxy {
                            service.proxy_pool.record_success(p);
                        }
                        pin_mut!(stream);

                        let mut interrupted: Option<UpstreamError> = None;
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(line) => {
                                    if !line.is_empty() {
                                        delivered = true;
                                        yield format!("{}\n", line);
                                    }
                                }
                                Err(e) => {
                                    interrupted = Some(e);
                                    break;
                                }
                            }
                        }

                        match interrupted {
                            None => {
                                info!(
                                    "[{}] Streaming completed - Model: {}, Attempt: {}",
                                    service.config.name,
                                    model,
                                    attempt + 1
                                );
                                service.logs.add_request_log(
                                    &model,
                                    &attempt_key,
                                    true,
                                    Some(200),
                                    start.elapsed().as_millis() as u64,
                                    request_time,
                                );
                                break 'attempts;
                            }
                            Some(e) if delivered => {
                                // Bytes already reached the client; do not
                                // retry, the stream just ends with the error.
                                if let Some(p) = &proxy {
                                    service.proxy_pool.record_failure(p);
                                }
                                error!(
                                    "[{}] Stream interrupted after delivery for model {}: {}",
                                    service.config.name,
                                    model,
                                    e.message()
                                );
                                service.log_stream_failure(
                                    &model,
                                    &attempt_key,
                                    &e,
                                    &payload,
                                    start.elapsed().as_millis() as u64,
                                    request_time,
                                );
                                fatal = Some(e);
                                break 'attempts;
                            }
                            Some(e) => e,
                        }
                    }
                    Err(e) => e,
                };

                // Attempt failed before any line reached the client
                if let Some(p) = &proxy {
                    service.proxy_pool.record_failure(p);
                }
                warn!(
                    "[{}] Streaming attempt {}/{} failed with key {}: {}",
                    service.config.name,
                    attempt + 1,
                    attempts,
                    redact_key(&attempt_key),
                    attempt_error.message()
                );
                service.log_stream_failure(
                    &model,
                    &attempt_key,
                    &attempt_error,
                    &payload,
                    start.elapsed().as_millis() as u64,
                    request_time,
                );

                let next_key = service
                    .key_manager
                    .handle_api_failure(&attempt_key, attempt + 1);
                if next_key.is_empty() || attempt + 1 >= attempts {
                    fatal = Some(attempt_error);
                    break 'attempts;
                }
                if next_key != attempt_key {
                    info!(
                        "[{}] Switched to key {} for next attempt",
                        service.config.name,
                        redact_key(&next_key)
                    );
                }
                current_key = next_key;
            }

            if let Some(e) = fatal {
                let failed: Result<(), UpstreamError> = Err(e);
                failed?;
            }
        }
    }

    fn log_stream_failure(
        &self,
        model: &str,
        api_key: &str,
        e: &UpstreamError,
        payload: &Value,
        latency_ms: u64,
        request_time: chrono::DateTime<Utc>,
    ) {
        self.logs.add_error_log(
            api_key,
            model,
            &format!("{}-chat-stream", self.config.name),
            &e.message(),
            e.status(),
            self.request_msg(payload),
            request_time,
        );
        self.logs.add_request_log(
            model,
            api_key,
            false,
            Some(e.status()),
            latency_ms,
            request_time,
        );
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    pub async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
        api_key: Option<String>,
    ) -> Result<Value, UpstreamError> {
        let api_key = match api_key {
            Some(key) if !key.is_empty() => key,
            _ => self.key_manager.next_working_key(),
        };
        if api_key.is_empty() {
            return Err(UpstreamError::NoApiKey {
                provider: self.config.name.clone(),
            });
        }

        let payload = request.to_payload();
        let start = Instant::now();
        let request_time = Utc::now();
        let proxy = self.proxy_pool.proxy_for_key(&api_key);

        let result = self
            .client
            .create_embeddings(&payload, &api_key, proxy.as_deref(), &self.config.custom_headers)
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_success(p);
                }
                self.logs.add_request_log(
                    &request.model,
                    &api_key,
                    true,
                    Some(200),
                    latency_ms,
                    request_time,
                );
                Ok(response)
            }
            Err(e) => {
                if let Some(p) = &proxy {
                    self.proxy_pool.record_failure(p);
                }
                error!(
                    "[{}] Embedding call failed for model {}: {}",
                    self.config.name,
                    request.model,
                    e.message()
                );
                self.logs.add_error_log(
                    &api_key,
                    &request.model,
                    &format!("{}-embedding", self.config.name),
                    &e.message(),
                    e.status(),
                    self.request_msg(&payload),
                    request_time,
                );
                self.logs.add_request_log(
                    &request.model,
                    &api_key,
                    false,
                    Some(e.status()),
                    latency_ms,
                    request_time,
                );
                Err(e)
            }
        }
    }

    // ========================================================================
    // Key verification
    // ========================================================================

    /// Issue a minimal probe completion with the given key. Used by the
    /// admin verify endpoints and the scheduled revalidation job; a success
    /// resets the key's failure count.
    pub async fn verify_key(&self, api_key: &str) -> Result<(), UpstreamError> {
        let request = ChatRequest {
            model: self.config.test_model.clone(),
            messages: vec![serde_json::json!({"role": "user", "content": "hi"})],
            stream: false,
            max_tokens: Some(10),
            temperature: None,
            top_p: None,
            top_k: None,
            stop: None,
            extra: serde_json::Map::new(),
        };

        self.chat_completion(&request, Some(api_key.to_string()))
            .await?;
        self.key_manager.reset_key_failure_count(api_key);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
