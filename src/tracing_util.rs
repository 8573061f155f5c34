use std::time::Instant;
use url::Url;
use uuid::Uuid;

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Helper to calculate elapsed time in milliseconds
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Mask a credential for log output, keeping just enough to correlate.
pub fn anonymize_key(key: &str) -> String {
    if key.is_empty() {
        return "unknown".to_string();
    }
    let prefix_len = key.len().min(4);
    let suffix_len = key.len().saturating_sub(prefix_len).min(2);
    let prefix = &key[..prefix_len];
    let suffix = if suffix_len > 0 {
        &key[key.len() - suffix_len..]
    } else {
        ""
    };
    format!("{}***{}", prefix, suffix)
}

/// Host-only rendering of the backend endpoint for logs; keeps deployment
/// names and query strings out of log lines.
pub fn redact_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("<unknown>");
            let port = parsed
                .port()
                .map(|p| format!(":{}", p))
                .unwrap_or_default();
            format!("{}://{}{}", parsed.scheme(), host, port)
        }
        Err(_) => "<invalid-endpoint>".to_string(),
    }
}
