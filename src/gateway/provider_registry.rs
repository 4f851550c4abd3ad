// Provider registry - named provider lifecycle and hot reload
//
// Owns the name -> (config, key manager, service) mapping. Reload swaps the
// service list in place under a write lock while in-flight requests keep the
// Arc they already dereferenced; per-key failure counts survive for keys
// present in both the old and new config of the same provider.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::gateway::key_manager::{KeyManager, KeyStatusSnapshot};
use crate::gateway::logs::LogStore;
use crate::gateway::provider_service::ProviderService;
use crate::gateway::proxy_pool::ProxyManager;
use crate::models::config::{AppSettings, ProviderConfig};

// ============================================================================
// Status reporting
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusEntry {
    pub name: String,
    pub path: String,
    pub base_url: String,
    pub keys_status: KeyStatusSnapshot,
    pub total_keys: usize,
    pub valid_keys_count: usize,
    pub invalid_keys_count: usize,
}

// ============================================================================
// ProviderRegistry
// ============================================================================

struct RegistryInner {
    services: Vec<Arc<ProviderService>>,
    default_provider: String,
}

pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
    proxy_pool: Arc<ProxyManager>,
    logs: Arc<LogStore>,
}

/// Parse the PROVIDERS_CONFIG JSON array. Individual malformed entries are
/// skipped with an error log; a malformed document is a hard error so a
/// reload can abort without touching the running set.
pub fn parse_providers_config(raw: &str) -> Result<Vec<ProviderConfig>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| format!("PROVIDERS_CONFIG is not valid JSON: {}", e))?;
    let items = value
        .as_array()
        .ok_or_else(|| "PROVIDERS_CONFIG must be a JSON array".to_string())?;

    let mut providers = Vec::new();
    for item in items {
        match serde_json::from_value::<ProviderConfig>(item.clone()) {
            Ok(provider) => providers.push(provider),
            Err(e) => error!("[Registry] Skipping malformed provider entry: {}", e),
        }
    }
    Ok(providers)
}

impl ProviderRegistry {
    pub fn new(proxy_pool: Arc<ProxyManager>, logs: Arc<LogStore>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                services: Vec::new(),
                default_provider: "default".to_string(),
            }),
            proxy_pool,
            logs,
        }
    }

    /// Build the service list from settings. A parse failure of
    /// PROVIDERS_CONFIG degrades to the synthesized default provider.
    pub async fn initialize(&self, settings: &AppSettings) {
        let configs = match parse_providers_config(&settings.providers_config) {
            Ok(configs) => configs,
            Err(e) => {
                error!("[Registry] {}; falling back to the default provider", e);
                Vec::new()
            }
        };

        let services = self.build_services(settings, &configs, &HashMap::new());
        let default_provider = Self::resolve_default(&settings.default_provider, &services);

        let mut inner = self.inner.write().await;
        inner.services = services;
        inner.default_provider = default_provider;
        info!(
            "[Registry] Initialized with {} providers, default: {}",
            inner.services.len(),
            inner.default_provider
        );
    }

    /// Re-parse the config and swap the provider set, carrying over failure
    /// counts for keys that exist in both the old and new pools. A parse
    /// error aborts the reload and keeps the previous state.
    pub async fn reload(&self, settings: &AppSettings) -> Result<(), String> {
        let configs = parse_providers_config(&settings.providers_config)?;

        let old_managers: HashMap<String, Arc<KeyManager>> = {
            let inner = self.inner.read().await;
            inner
                .services
                .iter()
                .map(|s| (s.config().name.to_lowercase(), Arc::clone(s.key_manager())))
                .collect()
        };

        let services = self.build_services(settings, &configs, &old_managers);
        let default_provider = Self::resolve_default(&settings.default_provider, &services);

        let mut inner = self.inner.write().await;
        inner.services = services;
        inner.default_provider = default_provider;
        info!(
            "[Registry] Configuration reloaded: {} providers active, default: {}",
            inner.services.len(),
            inner.default_provider
        );
        Ok(())
    }

    fn build_services(
        &self,
        settings: &AppSettings,
        configs: &[ProviderConfig],
        old_managers: &HashMap<String, Arc<KeyManager>>,
    ) -> Vec<Arc<ProviderService>> {
        let mut services = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let effective: Vec<ProviderConfig> = if configs.is_empty() {
            if settings.api_keys.is_empty() {
                warn!("[Registry] No providers configured and no global API keys");
                Vec::new()
            } else {
                info!("[Registry] No providers configured, synthesizing the default provider");
                vec![settings.default_provider_config()]
            }
        } else {
            configs.to_vec()
        };

        for config in effective {
            let key = config.name.to_lowercase();
            if key.is_empty() {
                warn!("[Registry] Skipping provider with empty name");
                continue;
            }
            if !seen.insert(key.clone()) {
                warn!("[Registry] Duplicate provider name '{}', skipping", config.name);
                continue;
            }
            if !config.enabled {
                info!("[Registry] Provider '{}' is disabled, skipping", config.name);
                continue;
            }
            if config.api_keys.is_empty() {
                warn!("[Registry] Provider '{}' has no API keys, skipping", config.name);
                continue;
            }

            let mut config = config;
            if config.test_model.is_empty() {
                config.test_model = settings.test_model.clone();
            }

            let key_manager = Arc::new(KeyManager::new(
                &config.name,
                config.api_keys.clone(),
                config.max_failures,
                config.max_retries,
            ));
            if let Some(old) = old_managers.get(&key) {
                key_manager.inherit_from(old);
            }

            info!(
                "[Registry] Registered provider '{}' with {} API keys",
                config.name,
                config.api_keys.len()
            );
            services.push(Arc::new(ProviderService::new(
                config,
                key_manager,
                Arc::clone(&self.proxy_pool),
                Arc::clone(&self.logs),
                settings.error_log_record_request_body,
            )));
        }
        services
    }

    /// An unset DEFAULT_PROVIDER (or the literal "default") resolves to the
    /// first enabled provider when named providers exist.
    fn resolve_default(configured: &str, services: &[Arc<ProviderService>]) -> String {
        let has_named = services
            .iter()
            .any(|s| !s.config().name.eq_ignore_ascii_case("default"));
        if (configured.is_empty() || configured == "default") && has_named {
            if let Some(first) = services.first() {
                let name = first.config().name.clone();
                info!("[Registry] DEFAULT_PROVIDER not set, using first enabled provider: {}", name);
                return name;
            }
        }
        if configured.is_empty() {
            "default".to_string()
        } else {
            configured.to_string()
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub async fn get(&self, name: &str) -> Option<Arc<ProviderService>> {
        let inner = self.inner.read().await;
        inner
            .services
            .iter()
            .find(|s| s.config().name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub async fn get_by_path(&self, path: &str) -> Option<Arc<ProviderService>> {
        let inner = self.inner.read().await;
        inner
            .services
            .iter()
            .find(|s| !s.config().path.is_empty() && s.config().path == path)
            .cloned()
    }

    pub async fn default_service(&self) -> Option<Arc<ProviderService>> {
        let name = self.inner.read().await.default_provider.clone();
        self.get(&name).await
    }

    pub async fn default_provider_name(&self) -> String {
        self.inner.read().await.default_provider.clone()
    }

    pub async fn all(&self) -> Vec<Arc<ProviderService>> {
        self.inner.read().await.services.clone()
    }

    pub async fn status(&self) -> Vec<ProviderStatusEntry> {
        let services = self.all().await;
        services
            .iter()
            .map(|service| {
                let snapshot = service.key_manager().all_keys_with_fail_count();
                ProviderStatusEntry {
                    name: service.config().name.clone(),
                    path: service.config().path.clone(),
                    base_url: service.config().base_url.clone(),
                    total_keys: service.key_manager().len(),
                    valid_keys_count: snapshot.valid_keys.len(),
                    invalid_keys_count: snapshot.invalid_keys.len(),
                    keys_status: snapshot,
                }
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            Arc::new(ProxyManager::new(vec![], 3, false)),
            Arc::new(LogStore::new(100)),
        )
    }

    fn settings_with_providers(providers_json: &str) -> AppSettings {
        let mut settings = AppSettings::default();
        settings.providers_config = providers_json.to_string();
        settings
    }

    const TWO_PROVIDERS: &str = r#"[
        {"name": "openai", "path": "oa", "base_url": "https://api.openai.com/v1", "api_keys": ["k1", "k2"]},
        {"name": "deepseek", "path": "ds", "base_url": "https://api.deepseek.com/v1", "api_keys": ["d1"]}
    ]"#;

    // ---- Parsing ----

    #[test]
    fn test_parse_empty_configs() {
        assert!(parse_providers_config("").unwrap().is_empty());
        assert!(parse_providers_config("[]").unwrap().is_empty());
        assert!(parse_providers_config("  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_json_is_error() {
        assert!(parse_providers_config("{not json").is_err());
        assert!(parse_providers_config(r#"{"name": "x"}"#).is_err());
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let raw = r#"[{"name": "good", "base_url": "https://u"}, {"path": "missing-name"}]"#;
        let configs = parse_providers_config(raw).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "good");
    }

    // ---- Initialization ----

    #[tokio::test]
    async fn test_initialize_registers_enabled_providers() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;

        assert!(reg.get("openai").await.is_some());
        assert!(reg.get("OPENAI").await.is_some());
        assert!(reg.get("deepseek").await.is_some());
        assert!(reg.get("missing").await.is_none());
        assert_eq!(reg.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_skips_disabled_and_keyless() {
        let raw = r#"[
            {"name": "off", "base_url": "https://u", "api_keys": ["k"], "enabled": false},
            {"name": "empty", "base_url": "https://u", "api_keys": []},
            {"name": "ok", "base_url": "https://u", "api_keys": ["k"]}
        ]"#;
        let reg = registry();
        reg.initialize(&settings_with_providers(raw)).await;

        assert_eq!(reg.all().await.len(), 1);
        assert!(reg.get("ok").await.is_some());
    }

    #[tokio::test]
    async fn test_initialize_rejects_duplicate_names_case_insensitive() {
        let raw = r#"[
            {"name": "OpenAI", "base_url": "https://a", "api_keys": ["k1"]},
            {"name": "openai", "base_url": "https://b", "api_keys": ["k2"]}
        ]"#;
        let reg = registry();
        reg.initialize(&settings_with_providers(raw)).await;

        let services = reg.all().await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].config().base_url, "https://a");
    }

    #[tokio::test]
    async fn test_initialize_synthesizes_default_provider() {
        let mut settings = AppSettings::default();
        settings.api_keys = vec!["g1".to_string(), "g2".to_string()];
        settings.filtered_models = vec!["banned".to_string()];

        let reg = registry();
        reg.initialize(&settings).await;

        let service = reg.default_service().await.unwrap();
        assert_eq!(service.config().name, "default");
        assert_eq!(service.config().api_keys.len(), 2);
        assert_eq!(service.config().filtered_models, vec!["banned"]);
        assert_eq!(reg.default_provider_name().await, "default");
    }

    #[tokio::test]
    async fn test_default_resolution_uses_first_named_provider() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;
        assert_eq!(reg.default_provider_name().await, "openai");

        let service = reg.default_service().await.unwrap();
        assert_eq!(service.config().name, "openai");
    }

    #[tokio::test]
    async fn test_explicit_default_provider_respected() {
        let mut settings = settings_with_providers(TWO_PROVIDERS);
        settings.default_provider = "deepseek".to_string();

        let reg = registry();
        reg.initialize(&settings).await;
        assert_eq!(reg.default_provider_name().await, "deepseek");
    }

    #[tokio::test]
    async fn test_get_by_path() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;

        assert_eq!(reg.get_by_path("ds").await.unwrap().config().name, "deepseek");
        assert!(reg.get_by_path("nope").await.is_none());
        assert!(reg.get_by_path("").await.is_none());
    }

    #[tokio::test]
    async fn test_test_model_falls_back_to_global() {
        let mut settings = settings_with_providers(TWO_PROVIDERS);
        settings.test_model = "probe-model".to_string();

        let reg = registry();
        reg.initialize(&settings).await;
        assert_eq!(reg.get("openai").await.unwrap().config().test_model, "probe-model");
    }

    // ---- Reload ----

    #[tokio::test]
    async fn test_reload_preserves_surviving_key_counts() {
        let reg = registry();
        reg.initialize(&settings_with_providers(
            r#"[{"name": "a", "base_url": "https://u", "api_keys": ["k1", "k2"]}]"#,
        ))
        .await;

        let manager = Arc::clone(reg.get("a").await.unwrap().key_manager());
        manager.record_failure("k1");
        manager.record_failure("k1");

        reg.reload(&settings_with_providers(
            r#"[{"name": "a", "base_url": "https://u", "api_keys": ["k1", "k3"]}]"#,
        ))
        .await
        .unwrap();

        let manager = Arc::clone(reg.get("a").await.unwrap().key_manager());
        assert_eq!(manager.fail_count("k1"), 2);
        assert_eq!(manager.fail_count("k3"), 0);
        assert_eq!(manager.fail_count("k2"), 0); // discarded
    }

    #[tokio::test]
    async fn test_reload_parse_error_retains_previous_state() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;

        let result = reg.reload(&settings_with_providers("{broken")).await;
        assert!(result.is_err());
        assert_eq!(reg.all().await.len(), 2);
        assert!(reg.get("openai").await.is_some());
    }

    #[tokio::test]
    async fn test_reload_twice_is_noop_on_state() {
        let settings = settings_with_providers(TWO_PROVIDERS);
        let reg = registry();
        reg.initialize(&settings).await;
        reg.get("openai").await.unwrap().key_manager().record_failure("k1");

        reg.reload(&settings).await.unwrap();
        let after_first: Vec<String> = reg.all().await.iter().map(|s| s.config().name.clone()).collect();
        let count_first = reg.get("openai").await.unwrap().key_manager().fail_count("k1");

        reg.reload(&settings).await.unwrap();
        let after_second: Vec<String> = reg.all().await.iter().map(|s| s.config().name.clone()).collect();
        let count_second = reg.get("openai").await.unwrap().key_manager().fail_count("k1");

        assert_eq!(after_first, after_second);
        assert_eq!(count_first, count_second);
        assert_eq!(count_first, 1);
    }

    #[tokio::test]
    async fn test_reload_removed_provider_discards_state() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;
        reg.get("deepseek").await.unwrap().key_manager().record_failure("d1");

        reg.reload(&settings_with_providers(
            r#"[{"name": "openai", "path": "oa", "base_url": "https://api.openai.com/v1", "api_keys": ["k1", "k2"]}]"#,
        ))
        .await
        .unwrap();
        assert!(reg.get("deepseek").await.is_none());

        // Re-adding it starts fresh
        reg.reload(&settings_with_providers(TWO_PROVIDERS)).await.unwrap();
        assert_eq!(reg.get("deepseek").await.unwrap().key_manager().fail_count("d1"), 0);
    }

    #[tokio::test]
    async fn test_inflight_service_survives_reload() {
        let reg = registry();
        reg.initialize(&settings_with_providers(TWO_PROVIDERS)).await;

        let held = reg.get("openai").await.unwrap();
        reg.reload(&settings_with_providers("[]")).await.unwrap();

        // The held snapshot still works even though the registry moved on
        assert_eq!(held.config().name, "openai");
        assert!(reg.get("openai").await.is_none());
    }

    // ---- Status ----

    #[tokio::test]
    async fn test_status_reports_key_partition() {
        let reg = registry();
        reg.initialize(&settings_with_providers(
            r#"[{"name": "a", "base_url": "https://u", "api_keys": ["k1", "k2"], "max_failures": 1}]"#,
        ))
        .await;
        reg.get("a").await.unwrap().key_manager().record_failure("k1");

        let status = reg.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "a");
        assert_eq!(status[0].total_keys, 2);
        assert_eq!(status[0].valid_keys_count, 1);
        assert_eq!(status[0].invalid_keys_count, 1);
    }
}
