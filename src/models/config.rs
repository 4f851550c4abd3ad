// Gateway configuration model
//
// AppSettings is deserialized from a JSON config file; every field carries a
// serde default so a partial file parses. PROVIDERS_CONFIG stays a raw JSON
// string and is parsed at registry level so a malformed value aborts a reload
// without touching the running provider set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// ============================================================================
// ProviderConfig
// ============================================================================

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Unique provider name (case-insensitive), e.g. "openai", "deepseek".
    pub name: String,
    /// URL slug used for `/{path}/v1/...` routing; may be empty for the default.
    #[serde(default)]
    pub path: String,
    /// Scheme + host of the upstream, e.g. "https://api.openai.com/v1".
    pub base_url: String,
    /// Ordered key pool.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Dedicated key for `/models`; empty means "use any valid key".
    #[serde(default)]
    pub model_request_key: String,
    /// Headers applied to every outbound request.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Model used when revalidating failed keys.
    #[serde(default)]
    pub test_model: String,
    /// Model ids removed from `/models` responses.
    #[serde(default)]
    pub filtered_models: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_timeout() -> u64 {
    300
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ============================================================================
// AppSettings
// ============================================================================

/// Top-level gateway settings, hot-reloaded by the config watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,

    // Default provider (used when PROVIDERS_CONFIG is empty)
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub custom_headers: HashMap<String, String>,
    pub timeout: u64,
    pub max_failures: u32,
    pub max_retries: u32,
    pub test_model: String,
    pub model_request_key: String,
    pub filtered_models: Vec<String>,

    // Authentication
    pub allowed_tokens: Vec<String>,
    /// Cookie token for the admin plane; falls back to the first allowed token.
    pub auth_token: String,

    // Multi-provider
    /// Raw JSON array of ProviderConfig entries.
    pub providers_config: String,
    pub default_provider: String,

    // Proxy pool
    pub proxies: Vec<String>,
    pub proxies_use_consistency_hash_by_api_key: bool,
    pub proxy_auto_check_enabled: bool,
    pub proxy_check_url: String,
    pub proxy_check_timeout: u64,
    pub proxy_check_interval_hours: f64,
    pub proxy_max_failures: u32,

    // Scheduler
    pub check_interval_hours: u64,
    /// UTC offset for the daily log GC, e.g. "+08:00". Invalid values fall
    /// back to UTC.
    pub timezone: String,

    // Logging collaborators
    pub error_log_record_request_body: bool,
    pub max_log_entries: usize,
    pub log_ttl_days: i64,

    // Config watcher
    pub config_check_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8700,
            base_url: "https://api.openai.com/v1".to_string(),
            api_keys: Vec::new(),
            custom_headers: HashMap::new(),
            timeout: default_timeout(),
            max_failures: default_max_failures(),
            max_retries: default_max_retries(),
            test_model: "gpt-4o-mini".to_string(),
            model_request_key: String::new(),
            filtered_models: Vec::new(),
            allowed_tokens: Vec::new(),
            auth_token: String::new(),
            providers_config: String::new(),
            default_provider: "default".to_string(),
            proxies: Vec::new(),
            proxies_use_consistency_hash_by_api_key: false,
            proxy_auto_check_enabled: false,
            proxy_check_url: "https://www.google.com/generate_204".to_string(),
            proxy_check_timeout: 10,
            proxy_check_interval_hours: 1.0,
            proxy_max_failures: 3,
            check_interval_hours: 1,
            timezone: "+00:00".to_string(),
            error_log_record_request_body: false,
            max_log_entries: 10_000,
            log_ttl_days: 7,
            config_check_interval_secs: 5,
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {}", path.display(), e))?;
        let mut settings: AppSettings = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse config file {}: {}", path.display(), e))?;
        if settings.auth_token.is_empty() {
            settings.auth_token = settings.allowed_tokens.first().cloned().unwrap_or_default();
        }
        Ok(settings)
    }

    /// Synthesize the "default" provider from the global settings.
    pub fn default_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            name: "default".to_string(),
            path: String::new(),
            base_url: self.base_url.clone(),
            api_keys: self.api_keys.clone(),
            model_request_key: self.model_request_key.clone(),
            custom_headers: self.custom_headers.clone(),
            timeout: self.timeout,
            max_failures: self.max_failures,
            max_retries: self.max_retries,
            test_model: self.test_model.clone(),
            filtered_models: self.filtered_models.clone(),
            enabled: true,
        }
    }
}

/// Shorten an API key for log output: `sk-abcdef...` becomes `sk-a…cdef`.
pub fn redact_key(key: &str) -> String {
    let n = key.chars().count();
    if n <= 8 {
        return "****".to_string();
    }
    let head: String = key.chars().take(4).collect();
    let tail: String = key.chars().skip(n - 4).collect();
    format!("{}…{}", head, tail)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let s = AppSettings::default();
        assert_eq!(s.port, 8700);
        assert_eq!(s.max_failures, 3);
        assert_eq!(s.max_retries, 3);
        assert!(!s.proxies_use_consistency_hash_by_api_key);
        assert_eq!(s.config_check_interval_secs, 5);
    }

    #[test]
    fn test_settings_partial_file_parses() {
        let json = r#"{"port": 9000, "api_keys": ["k1", "k2"]}"#;
        let s: AppSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.api_keys, vec!["k1", "k2"]);
        // Everything else keeps its default
        assert_eq!(s.timeout, 300);
        assert_eq!(s.default_provider, "default");
    }

    #[test]
    fn test_settings_load_backfills_auth_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(&path, r#"{"allowed_tokens": ["tok-1", "tok-2"]}"#).unwrap();

        let s = AppSettings::load(&path).unwrap();
        assert_eq!(s.auth_token, "tok-1");
    }

    #[test]
    fn test_settings_load_missing_file_errors() {
        let result = AppSettings::load(Path::new("/nonexistent/gateway.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_provider_config_defaults() {
        let json = r#"{"name": "openai", "base_url": "https://api.openai.com/v1"}"#;
        let p: ProviderConfig = serde_json::from_str(json).unwrap();
        assert!(p.enabled);
        assert_eq!(p.max_failures, 3);
        assert_eq!(p.timeout, 300);
        assert!(p.path.is_empty());
        assert!(p.api_keys.is_empty());
    }

    #[test]
    fn test_default_provider_config_inherits_globals() {
        let mut s = AppSettings::default();
        s.api_keys = vec!["k1".to_string()];
        s.filtered_models = vec!["banned".to_string()];
        s.timeout = 120;

        let p = s.default_provider_config();
        assert_eq!(p.name, "default");
        assert_eq!(p.api_keys, vec!["k1"]);
        assert_eq!(p.filtered_models, vec!["banned"]);
        assert_eq!(p.timeout, 120);
    }

    #[test]
    fn test_redact_key() {
        assert_eq!(redact_key("sk-abcdefgh1234"), "sk-a…1234");
        assert_eq!(redact_key("short"), "****");
        assert_eq!(redact_key(""), "****");
    }
}
