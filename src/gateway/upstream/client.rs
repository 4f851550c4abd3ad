// Upstream HTTP client
//
// Stateless reqwest wrapper for one OpenAI-compatible upstream. Every call
// takes the API key, an optional proxy URL, and the provider's custom
// headers; clients are built per call so the proxy can differ per request.
// Streaming calls surface a non-2xx response as an error before the first
// line is yielded.

use async_stream::try_stream;
use bytes::BytesMut;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use reqwest::{header, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, warn};

use crate::gateway::error::UpstreamError;

const CONNECT_TIMEOUT_SECS: u64 = 20;
/// The `/models` listing is small; it gets a short fixed timeout.
const MODELS_TIMEOUT_SECS: u64 = 30;

/// Ensure a proxy URL carries a scheme prefix.
pub fn normalize_proxy_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
        || trimmed.starts_with("socks5://")
        || trimmed.starts_with("socks5h://")
    {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

// ============================================================================
// UpstreamClient
// ============================================================================

pub struct UpstreamClient {
    base_url: String,
    timeout_secs: u64,
    /// Clients cached per proxy URL ("" = direct) so connection pools are
    /// reused across requests.
    client_cache: DashMap<String, Client>,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            client_cache: DashMap::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<Client, UpstreamError> {
        let cache_key = proxy.unwrap_or("").to_string();
        if let Some(client) = self.client_cache.get(&cache_key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(self.timeout_secs));

        if let Some(proxy_url) = proxy {
            let url = normalize_proxy_url(proxy_url);
            let reqwest_proxy = reqwest::Proxy::all(&url)
                .map_err(|e| UpstreamError::Network(format!("invalid proxy URL {}: {}", url, e)))?;
            builder = builder.proxy(reqwest_proxy);
        }

        let client = builder
            .build()
            .map_err(|e| UpstreamError::Network(format!("failed to build client: {}", e)))?;
        self.client_cache.insert(cache_key, client.clone());
        Ok(client)
    }

    fn build_headers(
        api_key: &str,
        custom_headers: &HashMap<String, String>,
    ) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {}", api_key)) {
            headers.insert(header::AUTHORIZATION, value);
        }

        for (name, value) in custom_headers {
            match (
                header::HeaderName::from_bytes(name.as_bytes()),
                header::HeaderValue::from_str(value),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    headers.insert(header_name, header_value);
                }
                _ => warn!("[Upstream] Skipping invalid custom header '{}'", name),
            }
        }
        headers
    }

    // ========================================================================
    // Unary calls
    // ========================================================================

    /// GET {base_url}/models.
    pub async fn get_models(
        &self,
        api_key: &str,
        proxy: Option<&str>,
        custom_headers: &HashMap<String, String>,
    ) -> Result<Value, UpstreamError> {
        let client = self.build_client(proxy)?;
        let url = format!("{}/models", self.base_url);
        let response = client
            .get(&url)
            .timeout(Duration::from_secs(MODELS_TIMEOUT_SECS))
            .headers(Self::build_headers(api_key, custom_headers))
            .send()
            .await?;

        Self::json_or_error(response, "get models").await
    }

    /// POST {base_url}/chat/completions (non-stream).
    pub async fn chat_completion(
        &self,
        payload: &Value,
        api_key: &str,
        proxy: Option<&str>,
        custom_headers: &HashMap<String, String>,
    ) -> Result<Value, UpstreamError> {
        let client = self.build_client(proxy)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response = client
            .post(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .headers(Self::build_headers(api_key, custom_headers))
            .json(payload)
            .send()
            .await?;

        Self::json_or_error(response, "chat completion").await
    }

    /// POST {base_url}/embeddings.
    pub async fn create_embeddings(
        &self,
        payload: &Value,
        api_key: &str,
        proxy: Option<&str>,
        custom_headers: &HashMap<String, String>,
    ) -> Result<Value, UpstreamError> {
        let client = self.build_client(proxy)?;
        let url = format!("{}/embeddings", self.base_url);
        let response = client
            .post(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .headers(Self::build_headers(api_key, custom_headers))
            .json(payload)
            .send()
            .await?;

        Self::json_or_error(response, "embeddings").await
    }

    async fn json_or_error(response: reqwest::Response, what: &str) -> Result<Value, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("[Upstream] {} failed - Status: {}, Content: {}", what, status, body);
            return Err(UpstreamError::http(status.as_u16(), body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Network(format!("invalid JSON response: {}", e)))
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// POST {base_url}/chat/completions with a streaming body.
    ///
    /// A non-2xx status is returned as `Err` before any line is produced, so
    /// callers can retry with another key without the client having observed
    /// output. After the first yielded line, errors terminate the stream.
    pub async fn chat_completion_stream(
        &self,
        payload: &Value,
        api_key: &str,
        proxy: Option<&str>,
        custom_headers: &HashMap<String, String>,
    ) -> Result<impl Stream<Item = Result<String, UpstreamError>> + Send, UpstreamError> {
        let client = self.build_client(proxy)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response = client
            .post(&url)
            .headers(Self::build_headers(api_key, custom_headers))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("[Upstream] stream chat failed - Status: {}, Content: {}", status, body);
            return Err(UpstreamError::http(status.as_u16(), body));
        }

        let mut bytes = response.bytes_stream();
        Ok(try_stream! {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(UpstreamError::from)?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(pos + 1);
                    line.truncate(line.len() - 1);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    yield String::from_utf8_lossy(&line).into_owned();
                }
            }
            if !buffer.is_empty() {
                yield String::from_utf8_lossy(&buffer).into_owned();
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
