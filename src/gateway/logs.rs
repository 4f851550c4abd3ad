// Request/error log store
//
// In-memory bounded collaborator behind the write-site contracts
// add_request_log / add_error_log. Durable persistence is out of scope; the
// store keeps a capped ring per log kind and supports the daily GC job.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::info;

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub model: String,
    pub api_key: String,
    pub is_success: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub request_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogEntry {
    pub api_key: String,
    pub model: String,
    /// Label like "openai-chat-stream" identifying the failing call site.
    pub error_type: String,
    pub error_log: String,
    pub error_code: u16,
    pub request_msg: Option<Value>,
    pub request_time: DateTime<Utc>,
}

// ============================================================================
// LogStore
// ============================================================================

pub struct LogStore {
    request_logs: Mutex<VecDeque<RequestLogEntry>>,
    error_logs: Mutex<VecDeque<ErrorLogEntry>>,
    max_entries: usize,
}

impl LogStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            request_logs: Mutex::new(VecDeque::new()),
            error_logs: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_request_log(
        &self,
        model: &str,
        api_key: &str,
        is_success: bool,
        status_code: Option<u16>,
        latency_ms: u64,
        request_time: DateTime<Utc>,
    ) {
        let mut logs = self.request_logs.lock();
        if logs.len() >= self.max_entries {
            logs.pop_front();
        }
        logs.push_back(RequestLogEntry {
            model: model.to_string(),
            api_key: api_key.to_string(),
            is_success,
            status_code,
            latency_ms,
            request_time,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_error_log(
        &self,
        api_key: &str,
        model: &str,
        error_type: &str,
        error_log: &str,
        error_code: u16,
        request_msg: Option<Value>,
        request_time: DateTime<Utc>,
    ) {
        let mut logs = self.error_logs.lock();
        if logs.len() >= self.max_entries {
            logs.pop_front();
        }
        logs.push_back(ErrorLogEntry {
            api_key: api_key.to_string(),
            model: model.to_string(),
            error_type: error_type.to_string(),
            error_log: error_log.to_string(),
            error_code,
            request_msg,
            request_time,
        });
    }

    /// Drop entries older than `ttl_days`. Returns (request, error) counts
    /// removed; driven by the daily GC job.
    pub fn delete_old_logs(&self, ttl_days: i64) -> (usize, usize) {
        let cutoff = Utc::now() - Duration::days(ttl_days);

        let removed_requests = {
            let mut logs = self.request_logs.lock();
            let before = logs.len();
            logs.retain(|e| e.request_time >= cutoff);
            before - logs.len()
        };
        let removed_errors = {
            let mut logs = self.error_logs.lock();
            let before = logs.len();
            logs.retain(|e| e.request_time >= cutoff);
            before - logs.len()
        };

        if removed_requests > 0 || removed_errors > 0 {
            info!(
                "[LogGC] Removed {} request logs and {} error logs older than {} days",
                removed_requests, removed_errors, ttl_days
            );
        }
        (removed_requests, removed_errors)
    }

    pub fn request_log_count(&self) -> usize {
        self.request_logs.lock().len()
    }

    pub fn error_log_count(&self) -> usize {
        self.error_logs.lock().len()
    }

    pub fn recent_request_logs(&self, limit: usize) -> Vec<RequestLogEntry> {
        let logs = self.request_logs.lock();
        logs.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_error_logs(&self, limit: usize) -> Vec<ErrorLogEntry> {
        let logs = self.error_logs.lock();
        logs.iter().rev().take(limit).cloned().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
