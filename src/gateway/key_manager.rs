// Key manager - per-provider API key pool
//
// Round-robin rotation with failure counting. A key is valid while its
// failure count stays below the provider's max_failures; a fully-invalid
// pool still yields the first key so callers try rather than refuse.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::models::config::redact_key;

// ============================================================================
// KeyStatusSnapshot
// ============================================================================

/// Per-key failure counts partitioned by validity.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatusSnapshot {
    pub valid_keys: HashMap<String, u32>,
    pub invalid_keys: HashMap<String, u32>,
    pub all_keys: HashMap<String, u32>,
}

// ============================================================================
// KeyManager
// ============================================================================

pub struct KeyManager {
    provider: String,
    api_keys: Vec<String>,
    max_failures: u32,
    max_retries: u32,
    /// Round-robin position; guarded separately from the failure counts so
    /// rotation never waits on counter updates.
    cursor: Mutex<usize>,
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl KeyManager {
    pub fn new(provider: &str, api_keys: Vec<String>, max_failures: u32, max_retries: u32) -> Self {
        if api_keys.is_empty() {
            warn!("[KeyManager] Provider '{}' initialized with an empty key pool", provider);
        }
        let failure_counts = api_keys.iter().map(|k| (k.clone(), 0)).collect();
        Self {
            provider: provider.to_string(),
            api_keys,
            max_failures,
            max_retries,
            cursor: Mutex::new(0),
            failure_counts: Mutex::new(failure_counts),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api_keys
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn len(&self) -> usize {
        self.api_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.api_keys.is_empty()
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Return the key at the cursor and advance (wrapping).
    pub fn next_key(&self) -> String {
        if self.api_keys.is_empty() {
            return String::new();
        }
        let mut cursor = self.cursor.lock();
        let key = self.api_keys[*cursor].clone();
        *cursor = (*cursor + 1) % self.api_keys.len();
        key
    }

    /// Advance until a valid key is found, scanning the full ring at most
    /// once. A fully-invalid pool falls back to the first key in config
    /// order; only an empty pool yields the empty string.
    pub fn next_working_key(&self) -> String {
        if self.api_keys.is_empty() {
            warn!("[KeyManager] Provider '{}' key pool is empty", self.provider);
            return String::new();
        }

        for _ in 0..self.api_keys.len() {
            let key = self.next_key();
            if self.is_valid(&key) {
                return key;
            }
        }

        warn!(
            "[KeyManager] Provider '{}' has no valid keys, falling back to the first key",
            self.provider
        );
        self.api_keys[0].clone()
    }

    /// First key (in config order) whose failure count is below the
    /// threshold; first key as fallback when none qualifies.
    pub fn first_valid_key(&self) -> String {
        let counts = self.failure_counts.lock();
        for key in &self.api_keys {
            if counts.get(key).copied().unwrap_or(0) < self.max_failures {
                return key.clone();
            }
        }
        drop(counts);

        if let Some(first) = self.api_keys.first() {
            warn!(
                "[KeyManager] Provider '{}' has no valid keys, returning first key",
                self.provider
            );
            return first.clone();
        }
        String::new()
    }

    /// Uniform choice among valid keys; first key as fallback.
    pub fn random_valid_key(&self) -> String {
        let valid: Vec<String> = {
            let counts = self.failure_counts.lock();
            self.api_keys
                .iter()
                .filter(|k| counts.get(*k).copied().unwrap_or(0) < self.max_failures)
                .cloned()
                .collect()
        };

        if let Some(key) = valid.choose(&mut rand::thread_rng()) {
            return key.clone();
        }
        if let Some(first) = self.api_keys.first() {
            warn!(
                "[KeyManager] Provider '{}' has no valid keys, returning first key",
                self.provider
            );
            return first.clone();
        }
        String::new()
    }

    // ========================================================================
    // Failure accounting
    // ========================================================================

    pub fn is_valid(&self, key: &str) -> bool {
        self.failure_counts.lock().get(key).copied().unwrap_or(0) < self.max_failures
    }

    pub fn fail_count(&self, key: &str) -> u32 {
        self.failure_counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Increment the key's failure count (capped at max_failures). Returns
    /// the next working key while the retry budget allows another attempt,
    /// or the empty string once it is exhausted.
    pub fn handle_api_failure(&self, api_key: &str, retries: u32) -> String {
        {
            let mut counts = self.failure_counts.lock();
            if let Some(count) = counts.get_mut(api_key) {
                *count = (*count + 1).min(self.max_failures);
                if *count >= self.max_failures {
                    warn!(
                        "[KeyManager] Provider '{}' key {} reached {} failures",
                        self.provider,
                        redact_key(api_key),
                        self.max_failures
                    );
                }
            }
        }

        if retries < self.max_retries {
            self.next_working_key()
        } else {
            String::new()
        }
    }

    /// Increment without consulting the retry budget; used by the scheduled
    /// revalidation job.
    pub fn record_failure(&self, api_key: &str) {
        let mut counts = self.failure_counts.lock();
        if let Some(count) = counts.get_mut(api_key) {
            *count = (*count + 1).min(self.max_failures);
        }
    }

    /// Zero a single key's failure count. Returns whether the key exists.
    pub fn reset_key_failure_count(&self, key: &str) -> bool {
        let mut counts = self.failure_counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count = 0;
            info!(
                "[KeyManager] Provider '{}' reset failure count for key {}",
                self.provider,
                redact_key(key)
            );
            return true;
        }
        warn!(
            "[KeyManager] Provider '{}' attempted reset of unknown key {}",
            self.provider,
            redact_key(key)
        );
        false
    }

    pub fn reset_failure_counts(&self) {
        let mut counts = self.failure_counts.lock();
        for count in counts.values_mut() {
            *count = 0;
        }
    }

    /// Keys with failure count above zero; snapshotted for revalidation.
    pub fn keys_with_failures(&self) -> Vec<String> {
        let counts = self.failure_counts.lock();
        self.api_keys
            .iter()
            .filter(|k| counts.get(*k).copied().unwrap_or(0) > 0)
            .cloned()
            .collect()
    }

    pub fn all_keys_with_fail_count(&self) -> KeyStatusSnapshot {
        let counts = self.failure_counts.lock();
        let mut valid_keys = HashMap::new();
        let mut invalid_keys = HashMap::new();
        let mut all_keys = HashMap::new();

        for key in &self.api_keys {
            let count = counts.get(key).copied().unwrap_or(0);
            all_keys.insert(key.clone(), count);
            if count < self.max_failures {
                valid_keys.insert(key.clone(), count);
            } else {
                invalid_keys.insert(key.clone(), count);
            }
        }

        KeyStatusSnapshot {
            valid_keys,
            invalid_keys,
            all_keys,
        }
    }

    // ========================================================================
    // Reload state carry-over
    // ========================================================================

    /// Inherit state from the manager this one replaces: failure counts are
    /// kept for keys present in both pools, and the rotation resumes at the
    /// first surviving key at or after the old cursor (start of the ring if
    /// no old key survived).
    pub fn inherit_from(&self, old: &KeyManager) {
        {
            let old_counts = old.failure_counts.lock();
            let mut counts = self.failure_counts.lock();
            for key in &self.api_keys {
                if let Some(&count) = old_counts.get(key) {
                    counts.insert(key.clone(), count.min(self.max_failures));
                }
            }
        }

        if self.api_keys.is_empty() || old.api_keys.is_empty() {
            return;
        }
        let old_cursor = *old.cursor.lock();
        for offset in 0..old.api_keys.len() {
            let candidate = &old.api_keys[(old_cursor + offset) % old.api_keys.len()];
            if let Some(idx) = self.api_keys.iter().position(|k| k == candidate) {
                *self.cursor.lock() = idx;
                info!(
                    "[KeyManager] Provider '{}' rotation resumed at key {}",
                    self.provider,
                    redact_key(candidate)
                );
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager(keys: &[&str], max_failures: u32, max_retries: u32) -> KeyManager {
        KeyManager::new(
            "test",
            keys.iter().map(|k| k.to_string()).collect(),
            max_failures,
            max_retries,
        )
    }

    // ---- Rotation ----

    #[test]
    fn test_next_key_round_robin_wraps() {
        let mgr = manager(&["k1", "k2", "k3"], 3, 3);
        assert_eq!(mgr.next_key(), "k1");
        assert_eq!(mgr.next_key(), "k2");
        assert_eq!(mgr.next_key(), "k3");
        assert_eq!(mgr.next_key(), "k1");
    }

    #[test]
    fn test_next_working_key_skips_invalid() {
        let mgr = manager(&["k1", "k2"], 1, 3);
        mgr.record_failure("k1");

        assert_eq!(mgr.next_working_key(), "k2");
        assert_eq!(mgr.next_working_key(), "k2");
    }

    #[test]
    fn test_next_working_key_all_invalid_returns_first() {
        let mgr = manager(&["k1", "k2", "k3"], 1, 3);
        for key in ["k1", "k2", "k3"] {
            mgr.record_failure(key);
        }
        assert_eq!(mgr.next_working_key(), "k1");
    }

    #[test]
    fn test_empty_pool_returns_empty_string() {
        let mgr = manager(&[], 3, 3);
        assert_eq!(mgr.next_key(), "");
        assert_eq!(mgr.next_working_key(), "");
        assert_eq!(mgr.first_valid_key(), "");
        assert_eq!(mgr.random_valid_key(), "");
    }

    #[test]
    fn test_first_valid_key_config_order() {
        let mgr = manager(&["k1", "k2", "k3"], 1, 3);
        mgr.record_failure("k1");
        assert_eq!(mgr.first_valid_key(), "k2");
    }

    #[test]
    fn test_random_valid_key_member_of_pool() {
        let mgr = manager(&["k1", "k2", "k3"], 1, 3);
        mgr.record_failure("k2");
        for _ in 0..20 {
            let key = mgr.random_valid_key();
            assert!(key == "k1" || key == "k3");
        }
    }

    #[test]
    fn test_random_valid_key_fallback_when_all_invalid() {
        let mgr = manager(&["k1", "k2"], 1, 3);
        mgr.record_failure("k1");
        mgr.record_failure("k2");
        assert_eq!(mgr.random_valid_key(), "k1");
    }

    // ---- Failure accounting ----

    #[test]
    fn test_handle_api_failure_increments_and_rotates() {
        let mgr = manager(&["k1", "k2"], 3, 3);
        let next = mgr.handle_api_failure("k1", 1);
        assert_eq!(mgr.fail_count("k1"), 1);
        assert!(!next.is_empty());
    }

    #[test]
    fn test_handle_api_failure_exhausted_returns_empty() {
        let mgr = manager(&["k1", "k2"], 3, 2);
        let next = mgr.handle_api_failure("k1", 2);
        assert_eq!(next, "");
        assert_eq!(mgr.fail_count("k1"), 1);
    }

    #[test]
    fn test_fail_count_capped_at_max_failures() {
        let mgr = manager(&["k1"], 3, 3);
        for _ in 0..10 {
            mgr.record_failure("k1");
        }
        assert_eq!(mgr.fail_count("k1"), 3);
        assert!(!mgr.is_valid("k1"));
    }

    #[test]
    fn test_unknown_key_not_counted() {
        let mgr = manager(&["k1"], 3, 3);
        mgr.record_failure("ghost");
        assert_eq!(mgr.fail_count("ghost"), 0);
        assert!(mgr.is_valid("ghost"));
    }

    #[test]
    fn test_reset_key_failure_count_idempotent() {
        let mgr = manager(&["k1"], 3, 3);
        mgr.record_failure("k1");
        assert!(mgr.reset_key_failure_count("k1"));
        assert!(mgr.reset_key_failure_count("k1"));
        assert_eq!(mgr.fail_count("k1"), 0);
        assert!(!mgr.reset_key_failure_count("missing"));
    }

    #[test]
    fn test_reset_failure_counts_zeroes_all() {
        let mgr = manager(&["k1", "k2"], 3, 3);
        mgr.record_failure("k1");
        mgr.record_failure("k2");
        mgr.reset_failure_counts();
        assert_eq!(mgr.fail_count("k1"), 0);
        assert_eq!(mgr.fail_count("k2"), 0);
    }

    #[test]
    fn test_snapshot_partitions_keys() {
        let mgr = manager(&["k1", "k2"], 1, 3);
        mgr.record_failure("k1");

        let snapshot = mgr.all_keys_with_fail_count();
        assert_eq!(snapshot.invalid_keys.get("k1"), Some(&1));
        assert_eq!(snapshot.valid_keys.get("k2"), Some(&0));
        assert_eq!(snapshot.all_keys.len(), 2);
    }

    #[test]
    fn test_keys_with_failures() {
        let mgr = manager(&["k1", "k2", "k3"], 3, 3);
        mgr.record_failure("k2");
        assert_eq!(mgr.keys_with_failures(), vec!["k2".to_string()]);
    }

    // ---- Reload carry-over ----

    #[test]
    fn test_inherit_preserves_surviving_counts() {
        let old = manager(&["k1", "k2"], 3, 3);
        old.record_failure("k1");
        old.record_failure("k1");

        let new = manager(&["k1", "k3"], 3, 3);
        new.inherit_from(&old);

        assert_eq!(new.fail_count("k1"), 2);
        assert_eq!(new.fail_count("k3"), 0);
    }

    #[test]
    fn test_inherit_caps_counts_to_new_threshold() {
        let old = manager(&["k1"], 5, 3);
        for _ in 0..5 {
            old.record_failure("k1");
        }

        let new = manager(&["k1"], 2, 3);
        new.inherit_from(&old);
        assert_eq!(new.fail_count("k1"), 2);
    }

    #[test]
    fn test_inherit_resumes_cursor_at_surviving_key() {
        let old = manager(&["k1", "k2", "k3"], 3, 3);
        old.next_key(); // old cursor now points at k2

        let new = manager(&["k3", "k2"], 3, 3);
        new.inherit_from(&old);

        assert_eq!(new.next_key(), "k2");
        assert_eq!(new.next_key(), "k3");
    }

    #[test]
    fn test_inherit_cursor_skips_removed_keys() {
        let old = manager(&["k1", "k2", "k3"], 3, 3);
        old.next_key(); // old cursor now points at k2

        // k2 gone; the first surviving key at/after the cursor is k3
        let new = manager(&["k1", "k3"], 3, 3);
        new.inherit_from(&old);

        assert_eq!(new.next_key(), "k3");
    }

    #[test]
    fn test_inherit_no_common_keys_starts_at_beginning() {
        let old = manager(&["k1", "k2"], 3, 3);
        old.next_key();

        let new = manager(&["a", "b"], 3, 3);
        new.inherit_from(&old);
        assert_eq!(new.next_key(), "a");
    }

    // ---- Invariants ----

    proptest! {
        /// Failure counts stay within [0, max_failures] under any op mix,
        /// and next_working_key always yields a pool member.
        #[test]
        fn prop_fail_count_bounded(
            ops in proptest::collection::vec((0usize..3, 0usize..3), 0..60),
            max_failures in 1u32..5,
        ) {
            let keys = ["k0", "k1", "k2"];
            let mgr = manager(&keys, max_failures, 3);

            for (op, key_idx) in ops {
                let key = keys[key_idx];
                match op {
                    0 => mgr.record_failure(key),
                    1 => { mgr.reset_key_failure_count(key); }
                    _ => { mgr.next_working_key(); }
                }
                for k in keys {
                    prop_assert!(mgr.fail_count(k) <= max_failures);
                }
                let working = mgr.next_working_key();
                prop_assert!(keys.contains(&working.as_str()));
            }
        }
    }
}
