//! 轻量级错误追踪模块
//!
//! 使用 tracing 记录错误，无需外部依赖

use crate::errors::GatewayError;
use crate::tracing_util::anonymize_key;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

const BACKEND_FAILURE_THRESHOLD: u64 = 5;
const BACKEND_FAILURE_WINDOW_SECS: u64 = 300;

static BACKEND_FAILURE_TRACKER: Lazy<DashMap<String, BackendFailureInfo>> =
    Lazy::new(DashMap::new);

#[derive(Debug)]
struct BackendFailureInfo {
    count: AtomicU64,
    first_failure: Instant,
    last_alerted: Option<Instant>,
}

pub fn capture_error_with_context(
    error: &GatewayError,
    request_id: &str,
    client_key: &str,
    route: &str,
) {
    error!(
        request_id = %request_id,
        route = %route,
        client = %anonymize_key(client_key),
        error = %error,
        "Request error"
    );
}

/// Count a backend failure against the backend host; emits an alert log
/// when failures pile up inside the window.
pub fn track_backend_failure(backend: &str, error: &GatewayError) {
    let key = if backend.is_empty() {
        "<unknown>".to_string()
    } else {
        backend.to_string()
    };

    let should_alert = BACKEND_FAILURE_TRACKER
        .entry(key.clone())
        .or_insert_with(|| BackendFailureInfo {
            count: AtomicU64::new(0),
            first_failure: Instant::now(),
            last_alerted: None,
        })
        .value_mut()
        .register_failure();

    if should_alert {
        error!(
            backend = %key,
            error = %error,
            threshold = BACKEND_FAILURE_THRESHOLD,
            window_secs = BACKEND_FAILURE_WINDOW_SECS,
            "ALERT: Repeated backend failures detected"
        );
    }

    cleanup_old_failure_trackers();
}

impl BackendFailureInfo {
    fn register_failure(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.first_failure);

        if elapsed > Duration::from_secs(BACKEND_FAILURE_WINDOW_SECS) {
            self.count.store(1, Ordering::SeqCst);
            self.first_failure = now;
            self.last_alerted = None;
            return false;
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        if count >= BACKEND_FAILURE_THRESHOLD {
            let should_alert = match self.last_alerted {
                None => true,
                Some(last) => now.duration_since(last) > Duration::from_secs(60),
            };

            if should_alert {
                self.last_alerted = Some(now);
                return true;
            }
        }

        false
    }
}

fn cleanup_old_failure_trackers() {
    let window = Duration::from_secs(BACKEND_FAILURE_WINDOW_SECS * 2);
    if let Some(cutoff) = Instant::now().checked_sub(window) {
        BACKEND_FAILURE_TRACKER.retain(|_, info| info.first_failure > cutoff);
    }
}
