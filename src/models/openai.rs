// OpenAI-compatible wire types
//
// Requests are forwarded to the upstream as-is, minus fields the upstream
// does not accept. Unknown fields are captured via serde flatten so new
// OpenAI parameters pass through without a code change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// ChatRequest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    /// Anything else the client sent (tools, response_format, seed, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Build the outbound payload: null fields are dropped by serde, and
    /// `top_k` is removed because OpenAI-compatible upstreams reject it.
    pub fn to_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("top_k");
            map.retain(|_, v| !v.is_null());
        }
        value
    }
}

// ============================================================================
// EmbeddingRequest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// A string or an array of strings.
    pub input: Value,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u64>,
}

impl EmbeddingRequest {
    pub fn to_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.retain(|_, v| !v.is_null());
        }
        value
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_chat_payload_drops_top_k_and_nulls() {
        let req = chat_request(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "top_k": 40,
            "temperature": 0.7
        }));
        let payload = req.to_payload();
        let obj = payload.as_object().unwrap();

        assert!(!obj.contains_key("top_k"));
        assert!(!obj.contains_key("max_tokens"));
        assert_eq!(obj["temperature"], json!(0.7));
        assert_eq!(obj["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn test_chat_extra_fields_forwarded() {
        let req = chat_request(json!({
            "model": "gpt-4o-mini",
            "messages": [],
            "seed": 42,
            "response_format": {"type": "json_object"}
        }));
        let payload = req.to_payload();

        assert_eq!(payload["seed"], json!(42));
        assert_eq!(payload["response_format"]["type"], json!("json_object"));
    }

    #[test]
    fn test_chat_stream_defaults_false() {
        let req = chat_request(json!({"model": "m", "messages": []}));
        assert!(!req.stream);
    }

    #[test]
    fn test_embedding_payload() {
        let req: EmbeddingRequest = serde_json::from_value(json!({
            "input": ["a", "b"],
            "model": "text-embedding-3-small",
            "dimensions": 256
        }))
        .unwrap();
        let payload = req.to_payload();
        let obj = payload.as_object().unwrap();

        assert_eq!(obj["input"], json!(["a", "b"]));
        assert_eq!(obj["dimensions"], json!(256));
        assert!(!obj.contains_key("encoding_format"));
    }
}
