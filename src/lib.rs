pub mod gateway;
pub mod models;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use gateway::logs::LogStore;
use gateway::provider_registry::ProviderRegistry;
use gateway::proxy_check::ProxyChecker;
use gateway::proxy_pool::ProxyManager;
use models::config::AppSettings;

// ============================================================================
// AppContext - dependency-injection root
// ============================================================================

/// Process-wide wiring built once at startup and passed by reference.
/// The proxy pool and log store are shared by every provider service; the
/// registry owns the provider configs and key managers.
pub struct AppContext {
    pub settings: RwLock<AppSettings>,
    pub registry: ProviderRegistry,
    pub proxy_pool: Arc<ProxyManager>,
    pub proxy_checker: ProxyChecker,
    pub logs: Arc<LogStore>,
    pub config_path: PathBuf,
}

impl AppContext {
    pub async fn new(settings: AppSettings, config_path: PathBuf) -> Arc<Self> {
        let proxy_pool = Arc::new(ProxyManager::new(
            settings.proxies.clone(),
            settings.proxy_max_failures,
            settings.proxies_use_consistency_hash_by_api_key,
        ));
        let logs = Arc::new(LogStore::new(settings.max_log_entries));
        let registry = ProviderRegistry::new(Arc::clone(&proxy_pool), Arc::clone(&logs));
        registry.initialize(&settings).await;

        let proxy_checker =
            ProxyChecker::new(&settings.proxy_check_url, settings.proxy_check_timeout);

        Arc::new(Self {
            settings: RwLock::new(settings),
            registry,
            proxy_pool,
            proxy_checker,
            logs,
            config_path,
        })
    }

    /// Apply freshly loaded settings: the registry reload runs first so a
    /// parse failure aborts before anything else mutates, then the proxy
    /// pool and checker pick up their new parameters and the settings handle
    /// is swapped for subsequent readers.
    pub async fn apply_settings(&self, new_settings: AppSettings) -> Result<(), String> {
        self.registry.reload(&new_settings).await?;

        self.proxy_pool.reload(
            new_settings.proxies.clone(),
            new_settings.proxy_max_failures,
            new_settings.proxies_use_consistency_hash_by_api_key,
        );
        self.proxy_checker.configure(
            &new_settings.proxy_check_url,
            new_settings.proxy_check_timeout,
        );

        *self.settings.write().await = new_settings;
        info!("[Config] New settings applied");
        Ok(())
    }
}
