// Background scheduler
//
// Three periodic jobs, each a sequential spawned loop so a job never runs
// concurrently with itself while distinct jobs proceed in parallel:
// - revalidate keys whose failure count is above zero (every N hours, 0 off)
// - probe all proxies out of band, cache bypassed (every M minutes)
// - log garbage collection daily at 00:00 in the configured UTC offset

use chrono::{FixedOffset, Utc};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::gateway::logs::LogStore;
use crate::gateway::provider_registry::ProviderRegistry;
use crate::gateway::proxy_check::ProxyChecker;
use crate::gateway::proxy_pool::ProxyManager;
use crate::models::config::redact_key;
use crate::AppContext;

/// Concurrency cap for the scheduled proxy probe batch.
const PROXY_CHECK_CONCURRENCY: usize = 5;
/// Poll cadence while a job is disabled via config, so a hot reload that
/// re-enables it takes effect without a restart.
const DISABLED_RECHECK_SECS: u64 = 300;

// ============================================================================
// Job bodies
// ============================================================================

/// Re-verify every key with a non-zero failure count. A successful probe
/// resets the count; a failed probe increments it (still capped).
pub async fn check_failed_keys(registry: &ProviderRegistry) {
    info!("[Scheduler] Starting scheduled check for failed API keys");

    for service in registry.all().await {
        let provider = service.config().name.clone();
        let keys = service.key_manager().keys_with_failures();
        if keys.is_empty() {
            continue;
        }
        info!(
            "[Scheduler] Provider '{}': verifying {} keys with failures",
            provider,
            keys.len()
        );

        for key in keys {
            match service.verify_key(&key).await {
                Ok(()) => {
                    info!(
                        "[Scheduler] Key {} verified, failure count reset",
                        redact_key(&key)
                    );
                }
                Err(e) => {
                    warn!(
                        "[Scheduler] Key {} verification failed ({}), incrementing failure count",
                        redact_key(&key),
                        e.status()
                    );
                    service.key_manager().record_failure(&key);
                }
            }
        }
    }
}

/// Probe every configured proxy with the cache bypassed and feed the results
/// back into the pool.
pub async fn check_proxies(
    proxy_pool: &ProxyManager,
    checker: &ProxyChecker,
    check_url: &str,
    check_timeout: u64,
) {
    let proxies = proxy_pool.all_proxies();
    if proxies.is_empty() {
        return;
    }

    checker.configure(check_url, check_timeout);
    info!("[Scheduler] Checking {} proxies", proxies.len());

    let results = checker
        .check_many(&proxies, false, PROXY_CHECK_CONCURRENCY)
        .await;

    let mut available = 0usize;
    let mut newly_disabled = 0usize;
    for result in results {
        proxy_pool.update_last_check_time(&result.proxy);
        if result.is_available {
            proxy_pool.record_success(&result.proxy);
            available += 1;
        } else {
            if proxy_pool.record_failure(&result.proxy) {
                newly_disabled += 1;
            }
            warn!(
                "[Scheduler] Proxy {} check failed: {}",
                result.proxy,
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }
    }

    let status = proxy_pool.status();
    info!(
        "[Scheduler] Proxy check completed: {}/{} available, {} disabled, {} newly disabled",
        available,
        status.total,
        status.disabled,
        newly_disabled
    );
}

pub fn gc_logs(logs: &LogStore, ttl_days: i64) {
    let (requests, errors) = logs.delete_old_logs(ttl_days);
    info!(
        "[Scheduler] Log GC done: {} request logs, {} error logs removed",
        requests, errors
    );
}

// ============================================================================
// Timezone helpers
// ============================================================================

/// Parse a UTC offset like "+08:00" or "-05:30" ("UTC" and "" mean +00:00).
pub fn parse_utc_offset(s: &str) -> FixedOffset {
    let utc = FixedOffset::east_opt(0).expect("zero offset is valid");
    let trimmed = s.trim().trim_start_matches("UTC");
    if trimmed.is_empty() {
        return utc;
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1i32, &trimmed[1..]),
        Some(b'-') => (-1i32, &trimmed[1..]),
        _ => (1i32, trimmed),
    };

    let mut parts = rest.splitn(2, ':');
    let hours: i32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(h) => h,
        None => {
            warn!("[Scheduler] Invalid timezone '{}', falling back to UTC", s);
            return utc;
        }
    };
    let minutes: i32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).unwrap_or(utc)
}

/// Seconds until the next local midnight in the given offset.
pub fn secs_until_next_midnight(offset: FixedOffset) -> u64 {
    let now = Utc::now().with_timezone(&offset);
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_local_timezone(offset)
        .single()
        .unwrap_or_else(|| now.fixed_offset());
    (midnight - now).num_seconds().max(1) as u64
}

// ============================================================================
// Loop wiring
// ============================================================================

/// Spawn the three scheduler loops. Intervals are re-read from settings on
/// every iteration so config reloads apply without restarting.
pub fn start_scheduler(ctx: Arc<AppContext>) {
    // Failed-key revalidation
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            info!("[Scheduler] Key revalidation loop started");
            loop {
                let hours = ctx.settings.read().await.check_interval_hours;
                if hours == 0 {
                    sleep(Duration::from_secs(DISABLED_RECHECK_SECS)).await;
                    continue;
                }
                sleep(Duration::from_secs(hours * 3600)).await;
                check_failed_keys(&ctx.registry).await;
            }
        });
    }

    // Proxy probing
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            info!("[Scheduler] Proxy check loop started");
            loop {
                let (enabled, interval_hours, check_url, check_timeout) = {
                    let settings = ctx.settings.read().await;
                    (
                        settings.proxy_auto_check_enabled,
                        settings.proxy_check_interval_hours,
                        settings.proxy_check_url.clone(),
                        settings.proxy_check_timeout,
                    )
                };

                if !enabled || interval_hours <= 0.0 {
                    sleep(Duration::from_secs(DISABLED_RECHECK_SECS)).await;
                    continue;
                }

                let interval_minutes = ((interval_hours * 60.0) as u64).max(1);
                sleep(Duration::from_secs(interval_minutes * 60)).await;
                check_proxies(&ctx.proxy_pool, &ctx.proxy_checker, &check_url, check_timeout).await;
            }
        });
    }

    // Daily log GC at 00:00 local
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            info!("[Scheduler] Log GC loop started");
            loop {
                let (timezone, ttl_days) = {
                    let settings = ctx.settings.read().await;
                    (settings.timezone.clone(), settings.log_ttl_days)
                };
                let offset = parse_utc_offset(&timezone);
                let wait = secs_until_next_midnight(offset);
                sleep(Duration::from_secs(wait)).await;
                gc_logs(&ctx.logs, ttl_days);
            }
        });
    }

}

// ============================================================================
// Tests
// ============================================================================
