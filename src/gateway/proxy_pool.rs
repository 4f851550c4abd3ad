// Proxy pool manager
//
// Tracks per-proxy failure counts, auto-disables proxies past the failure
// threshold, and maintains sticky API-key -> proxy bindings when consistency
// hashing is enabled. Shared process-wide by all provider services.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tracing::{debug, info, warn};

// ============================================================================
// Status reporting
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub failure_count: u32,
    pub is_disabled: bool,
    pub bound_keys_count: usize,
    pub last_check_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyPoolStatus {
    pub total: usize,
    pub available: usize,
    pub disabled: usize,
    pub proxies: HashMap<String, ProxyStatus>,
}

// ============================================================================
// ProxyManager
// ============================================================================

struct PoolState {
    proxies: Vec<String>,
    failure_counts: HashMap<String, u32>,
    disabled: HashSet<String>,
    /// api_key -> proxy, populated only in consistency-hash mode.
    bindings: HashMap<String, String>,
    last_check: HashMap<String, i64>,
    max_failures: u32,
    use_consistency_hash: bool,
}

pub struct ProxyManager {
    state: Mutex<PoolState>,
}

fn hash_key(api_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    api_key.hash(&mut hasher);
    hasher.finish()
}

impl ProxyManager {
    pub fn new(proxies: Vec<String>, max_failures: u32, use_consistency_hash: bool) -> Self {
        let failure_counts = proxies.iter().map(|p| (p.clone(), 0)).collect();
        Self {
            state: Mutex::new(PoolState {
                proxies,
                failure_counts,
                disabled: HashSet::new(),
                bindings: HashMap::new(),
                last_check: HashMap::new(),
                max_failures,
                use_consistency_hash,
            }),
        }
    }

    pub fn all_proxies(&self) -> Vec<String> {
        self.state.lock().proxies.clone()
    }

    pub fn available_proxies(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .proxies
            .iter()
            .filter(|p| !state.disabled.contains(*p))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().proxies.is_empty()
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Resolve the proxy for an API key.
    ///
    /// Consistency-hash mode honors an existing binding while its proxy is
    /// still available; otherwise it binds `available[hash(key) % len]`.
    /// Without hashing a random available proxy is returned. With every
    /// proxy disabled the first proxy of the whole list is the last-resort
    /// candidate; the caller may still fail, the policy is try rather than
    /// refuse.
    pub fn proxy_for_key(&self, api_key: &str) -> Option<String> {
        let mut state = self.state.lock();
        if state.proxies.is_empty() {
            return None;
        }

        let available: Vec<String> = state
            .proxies
            .iter()
            .filter(|p| !state.disabled.contains(*p))
            .cloned()
            .collect();

        if available.is_empty() {
            warn!("[ProxyPool] All proxies disabled, using first proxy as last resort");
            return state.proxies.first().cloned();
        }

        if state.use_consistency_hash {
            if let Some(bound) = state.bindings.get(api_key) {
                if available.contains(bound) {
                    return Some(bound.clone());
                }
                let stale = bound.clone();
                state.bindings.remove(api_key);
                debug!("[ProxyPool] Dropped stale binding to unavailable proxy {}", stale);
            }

            let proxy = available[(hash_key(api_key) % available.len() as u64) as usize].clone();
            state.bindings.insert(api_key.to_string(), proxy.clone());
            Some(proxy)
        } else {
            available.choose(&mut rand::thread_rng()).cloned()
        }
    }

    // ========================================================================
    // Failure accounting
    // ========================================================================

    /// Record a failed round-trip through `proxy`. Returns `true` exactly
    /// when this call causes the disable transition.
    pub fn record_failure(&self, proxy: &str) -> bool {
        let mut state = self.state.lock();
        let count = match state.failure_counts.get_mut(proxy) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => return false,
        };

        if count >= state.max_failures && !state.disabled.contains(proxy) {
            state.disabled.insert(proxy.to_string());
            let unbound = Self::drop_bindings_to(&mut state, proxy);
            warn!(
                "[ProxyPool] Proxy {} disabled after {} failures, unbound {} keys",
                proxy, count, unbound
            );
            return true;
        }

        info!(
            "[ProxyPool] Proxy {} failure count: {}/{}",
            proxy, count, state.max_failures
        );
        false
    }

    /// Zero the failure count after a successful round-trip.
    pub fn record_success(&self, proxy: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.failure_counts.get_mut(proxy) {
            if *count > 0 {
                *count = 0;
                debug!("[ProxyPool] Proxy {} succeeded, failure count reset", proxy);
            }
        }
    }

    /// Reset failure count and re-enable; used by the scheduled probe when a
    /// proxy answers again.
    pub fn reset(&self, proxy: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.failure_counts.get_mut(proxy) {
            *count = 0;
        }
        if state.disabled.remove(proxy) {
            info!("[ProxyPool] Proxy {} reset and re-enabled", proxy);
        }
    }

    pub fn reset_all(&self) {
        let mut state = self.state.lock();
        for count in state.failure_counts.values_mut() {
            *count = 0;
        }
        state.disabled.clear();
        state.bindings.clear();
        info!("[ProxyPool] All proxies reset");
    }

    pub fn disable(&self, proxy: &str) {
        let mut state = self.state.lock();
        if state.proxies.iter().any(|p| p == proxy) {
            state.disabled.insert(proxy.to_string());
            let unbound = Self::drop_bindings_to(&mut state, proxy);
            info!(
                "[ProxyPool] Proxy {} manually disabled, unbound {} keys",
                proxy, unbound
            );
        }
    }

    pub fn enable(&self, proxy: &str) {
        let mut state = self.state.lock();
        if state.proxies.iter().any(|p| p == proxy) {
            state.disabled.remove(proxy);
            if let Some(count) = state.failure_counts.get_mut(proxy) {
                *count = 0;
            }
            info!("[ProxyPool] Proxy {} manually enabled", proxy);
        }
    }

    fn drop_bindings_to(state: &mut PoolState, proxy: &str) -> usize {
        let keys: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, v)| v.as_str() == proxy)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.bindings.remove(key);
        }
        keys.len()
    }

    // ========================================================================
    // Reload / bookkeeping
    // ========================================================================

    /// Apply a new proxy list in place: unseen proxies start fresh, removed
    /// proxies lose their state and bindings, survivors keep theirs.
    pub fn reload(&self, new_proxies: Vec<String>, max_failures: u32, use_consistency_hash: bool) {
        let mut state = self.state.lock();
        let new_set: HashSet<&String> = new_proxies.iter().collect();
        let old_set: HashSet<String> = state.proxies.iter().cloned().collect();

        for proxy in &new_proxies {
            if !old_set.contains(proxy) {
                state.failure_counts.insert(proxy.clone(), 0);
                info!("[ProxyPool] Added proxy: {}", proxy);
            }
        }

        let removed: Vec<String> = old_set
            .iter()
            .filter(|p| !new_set.contains(*p))
            .cloned()
            .collect();
        for proxy in removed {
            state.failure_counts.remove(&proxy);
            state.disabled.remove(&proxy);
            state.last_check.remove(&proxy);
            Self::drop_bindings_to(&mut state, &proxy);
            info!("[ProxyPool] Removed proxy: {}", proxy);
        }

        state.proxies = new_proxies;
        state.max_failures = max_failures;
        state.use_consistency_hash = use_consistency_hash;
    }

    pub fn update_last_check_time(&self, proxy: &str) {
        let mut state = self.state.lock();
        state
            .last_check
            .insert(proxy.to_string(), chrono::Utc::now().timestamp());
    }

    pub fn unbind_key(&self, api_key: &str) {
        let mut state = self.state.lock();
        if let Some(proxy) = state.bindings.remove(api_key) {
            info!("[ProxyPool] Unbound API key from proxy {}", proxy);
        }
    }

    pub fn status(&self) -> ProxyPoolStatus {
        let state = self.state.lock();
        let mut proxies = HashMap::new();
        for proxy in &state.proxies {
            proxies.insert(
                proxy.clone(),
                ProxyStatus {
                    failure_count: state.failure_counts.get(proxy).copied().unwrap_or(0),
                    is_disabled: state.disabled.contains(proxy),
                    bound_keys_count: state.bindings.values().filter(|v| *v == proxy).count(),
                    last_check_time: state.last_check.get(proxy).copied(),
                },
            );
        }
        ProxyPoolStatus {
            total: state.proxies.len(),
            available: state.proxies.len() - state.disabled.len(),
            disabled: state.disabled.len(),
            proxies,
        }
    }

    #[cfg(test)]
    fn bound_proxy(&self, api_key: &str) -> Option<String> {
        self.state.lock().bindings.get(api_key).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies() -> Vec<String> {
        vec![
            "http://proxy1.example.com:8080".to_string(),
            "http://proxy2.example.com:8080".to_string(),
            "http://proxy3.example.com:8080".to_string(),
        ]
    }

    fn pool(use_hash: bool) -> ProxyManager {
        ProxyManager::new(proxies(), 3, use_hash)
    }

    // ---- Selection ----

    #[test]
    fn test_no_proxies_returns_none() {
        let mgr = ProxyManager::new(vec![], 3, true);
        assert!(mgr.proxy_for_key("sk-test").is_none());
    }

    #[test]
    fn test_consistency_hash_is_sticky() {
        let mgr = pool(true);
        let p1 = mgr.proxy_for_key("sk-test-key-12345").unwrap();
        let p2 = mgr.proxy_for_key("sk-test-key-12345").unwrap();
        let p3 = mgr.proxy_for_key("sk-test-key-12345").unwrap();

        assert_eq!(p1, p2);
        assert_eq!(p2, p3);
        assert!(proxies().contains(&p1));
        assert_eq!(mgr.bound_proxy("sk-test-key-12345"), Some(p1));
    }

    #[test]
    fn test_hash_mode_distributes_across_proxies() {
        let mgr = pool(true);
        let mut used = HashSet::new();
        for i in 0..100 {
            used.insert(mgr.proxy_for_key(&format!("sk-test-key-{}", i)).unwrap());
        }
        assert!(used.len() > 1);
    }

    #[test]
    fn test_random_mode_creates_no_binding() {
        let mgr = pool(false);
        let proxy = mgr.proxy_for_key("sk-test").unwrap();
        assert!(proxies().contains(&proxy));
        assert!(mgr.bound_proxy("sk-test").is_none());
    }

    #[test]
    fn test_all_disabled_falls_back_to_first() {
        let mgr = ProxyManager::new(proxies(), 1, true);
        for proxy in proxies() {
            mgr.record_failure(&proxy);
        }
        assert_eq!(mgr.proxy_for_key("k").as_deref(), Some("http://proxy1.example.com:8080"));
    }

    // ---- Failure accounting ----

    #[test]
    fn test_record_failure_below_threshold() {
        let mgr = pool(true);
        let proxy = &proxies()[0];
        assert!(!mgr.record_failure(proxy));
        assert_eq!(mgr.status().proxies[proxy].failure_count, 1);
    }

    #[test]
    fn test_record_failure_disables_at_threshold() {
        let mgr = pool(true);
        let proxy = &proxies()[0];
        assert!(!mgr.record_failure(proxy));
        assert!(!mgr.record_failure(proxy));
        assert!(mgr.record_failure(proxy));
        assert!(mgr.status().proxies[proxy].is_disabled);
    }

    #[test]
    fn test_disable_transition_reported_once() {
        let mgr = ProxyManager::new(proxies(), 2, true);
        let proxy = &proxies()[0];
        assert!(!mgr.record_failure(proxy));
        assert!(mgr.record_failure(proxy));
        // Further failures do not re-report the transition
        assert!(!mgr.record_failure(proxy));
    }

    #[test]
    fn test_disable_clears_bindings_to_that_proxy_only() {
        let mgr = ProxyManager::new(proxies(), 2, true);
        let mut by_proxy: HashMap<String, Vec<String>> = HashMap::new();
        for i in 0..20 {
            let key = format!("key-{}", i);
            let proxy = mgr.proxy_for_key(&key).unwrap();
            by_proxy.entry(proxy).or_default().push(key);
        }
        let (victim, bound_keys) = by_proxy
            .iter()
            .find(|(_, keys)| !keys.is_empty())
            .map(|(p, k)| (p.clone(), k.clone()))
            .unwrap();

        mgr.record_failure(&victim);
        mgr.record_failure(&victim);

        for key in &bound_keys {
            assert!(mgr.bound_proxy(key).is_none());
        }
        // Keys bound elsewhere are untouched
        for (proxy, keys) in &by_proxy {
            if proxy != &victim {
                for key in keys {
                    assert_eq!(mgr.bound_proxy(key).as_ref(), Some(proxy));
                }
            }
        }
    }

    #[test]
    fn test_rebind_after_disable() {
        let mgr = ProxyManager::new(
            vec!["http://p1:8080".to_string(), "http://p2:8080".to_string()],
            2,
            true,
        );
        let first = mgr.proxy_for_key("abc").unwrap();
        mgr.record_failure(&first);
        mgr.record_failure(&first);

        let second = mgr.proxy_for_key("abc").unwrap();
        assert_ne!(first, second);
        assert_eq!(mgr.bound_proxy("abc"), Some(second));
    }

    #[test]
    fn test_record_success_resets_count() {
        let mgr = pool(true);
        let proxy = &proxies()[0];
        mgr.record_failure(proxy);
        mgr.record_failure(proxy);
        mgr.record_success(proxy);
        assert_eq!(mgr.status().proxies[proxy].failure_count, 0);
    }

    #[test]
    fn test_record_failure_unknown_proxy_ignored() {
        let mgr = pool(true);
        assert!(!mgr.record_failure("http://unknown:1"));
        assert!(!mgr.record_failure(""));
    }

    // ---- Reset / enable / disable ----

    #[test]
    fn test_reset_reenables() {
        let mgr = ProxyManager::new(proxies(), 2, true);
        let proxy = &proxies()[0];
        mgr.record_failure(proxy);
        mgr.record_failure(proxy);
        assert!(mgr.status().proxies[proxy].is_disabled);

        mgr.reset(proxy);
        let status = mgr.status();
        assert!(!status.proxies[proxy].is_disabled);
        assert_eq!(status.proxies[proxy].failure_count, 0);
    }

    #[test]
    fn test_enable_after_disable_zeroes_count() {
        let mgr = pool(true);
        let proxy = &proxies()[0];
        mgr.record_failure(proxy);
        mgr.disable(proxy);

        mgr.enable(proxy);
        let status = mgr.status();
        assert!(!status.proxies[proxy].is_disabled);
        assert_eq!(status.proxies[proxy].failure_count, 0);
    }

    #[test]
    fn test_manual_disable_drops_bindings() {
        let mgr = pool(true);
        let key = "sk-abc";
        let proxy = mgr.proxy_for_key(key).unwrap();
        mgr.disable(&proxy);
        assert!(mgr.bound_proxy(key).is_none());
    }

    #[test]
    fn test_reset_all() {
        let mgr = pool(true);
        mgr.proxy_for_key("k1");
        mgr.record_failure(&proxies()[1]);
        mgr.disable(&proxies()[0]);

        mgr.reset_all();
        let status = mgr.status();
        assert_eq!(status.disabled, 0);
        assert!(status.proxies.values().all(|p| p.failure_count == 0));
        assert!(status.proxies.values().all(|p| p.bound_keys_count == 0));
    }

    // ---- Reload ----

    #[test]
    fn test_reload_adds_new_proxy_fresh() {
        let mgr = pool(true);
        let mut new_list = proxies();
        new_list.push("http://proxy4.example.com:8080".to_string());
        mgr.reload(new_list, 3, true);

        let status = mgr.status();
        assert_eq!(status.total, 4);
        assert_eq!(status.proxies["http://proxy4.example.com:8080"].failure_count, 0);
    }

    #[test]
    fn test_reload_removes_old_proxy_and_bindings() {
        let mgr = ProxyManager::new(proxies(), 3, true);
        // Bind every key so at least one lands on the proxy being removed
        let mut victim_keys = Vec::new();
        for i in 0..20 {
            let key = format!("key-{}", i);
            if mgr.proxy_for_key(&key).as_deref() == Some(proxies()[0].as_str()) {
                victim_keys.push(key);
            }
        }

        mgr.reload(proxies()[1..].to_vec(), 3, true);

        let status = mgr.status();
        assert_eq!(status.total, 2);
        assert!(!status.proxies.contains_key(&proxies()[0]));
        for key in victim_keys {
            assert!(mgr.bound_proxy(&key).is_none());
        }
    }

    #[test]
    fn test_reload_preserves_surviving_state() {
        let mgr = pool(true);
        mgr.record_failure(&proxies()[1]);
        mgr.reload(proxies(), 3, true);
        assert_eq!(mgr.status().proxies[&proxies()[1]].failure_count, 1);
    }

    #[test]
    fn test_reload_twice_is_noop() {
        let mgr = pool(true);
        mgr.record_failure(&proxies()[0]);
        mgr.proxy_for_key("sticky");

        mgr.reload(proxies(), 3, true);
        let first = mgr.status();
        mgr.reload(proxies(), 3, true);
        let second = mgr.status();

        assert_eq!(first.total, second.total);
        assert_eq!(
            first.proxies[&proxies()[0]].failure_count,
            second.proxies[&proxies()[0]].failure_count
        );
        assert_eq!(
            first.proxies[&proxies()[0]].bound_keys_count,
            second.proxies[&proxies()[0]].bound_keys_count
        );
    }

    // ---- Status ----

    #[test]
    fn test_status_counts() {
        let mgr = pool(true);
        mgr.disable(&proxies()[0]);
        mgr.record_failure(&proxies()[1]);
        mgr.proxy_for_key("key-a");

        let status = mgr.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.available, 2);
        assert_eq!(status.disabled, 1);
        assert!(status.proxies[&proxies()[0]].is_disabled);
        assert_eq!(status.proxies[&proxies()[1]].failure_count, 1);
    }

    #[test]
    fn test_update_last_check_time() {
        let mgr = pool(true);
        assert!(mgr.status().proxies[&proxies()[0]].last_check_time.is_none());
        mgr.update_last_check_time(&proxies()[0]);
        assert!(mgr.status().proxies[&proxies()[0]].last_check_time.is_some());
    }

    #[test]
    fn test_unbind_key() {
        let mgr = pool(true);
        mgr.proxy_for_key("k1");
        mgr.unbind_key("k1");
        assert!(mgr.bound_proxy("k1").is_none());
    }
}
