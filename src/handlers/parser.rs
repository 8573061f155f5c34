use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    method: String,
    target: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ParsedRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|value| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn route_path(&self) -> &str {
        self.target
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or_else(|| self.target.as_str())
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    #[cfg(test)]
    pub fn new_for_tests(
        method: &str,
        target: &str,
        version: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        let normalized_headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();

        Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers: normalized_headers,
            body,
        }
    }
}

pub fn extract_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            return line[15..].trim().parse::<usize>().ok();
        }
    }
    None
}

pub fn parse_http_request(request_bytes: &[u8]) -> GatewayResult<ParsedRequest> {
    let header_end = request_bytes
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| GatewayError::BadRequest("Malformed HTTP request".to_string()))?;

    let header_bytes = &request_bytes[..header_end];
    let header_str = std::str::from_utf8(header_bytes)
        .map_err(|_| GatewayError::BadRequest("Invalid HTTP headers".to_string()))?;

    let mut header_lines = header_str.split("\r\n");
    let request_line = header_lines
        .next()
        .ok_or_else(|| GatewayError::BadRequest("Missing request line".to_string()))?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(GatewayError::BadRequest("Invalid request line".to_string()));
    }

    let mut headers = HashMap::with_capacity(16);
    for line in header_lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let body = request_bytes[header_end + 4..].to_vec();

    Ok(ParsedRequest {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        body,
    })
}

/// Resolve the backend credential for one request: a configured static token
/// wins; otherwise the `Authorization` header with a literal `"Bearer "`
/// prefix stripped. The resolved string is treated opaquely.
pub fn resolve_credential(
    config: &GatewayConfig,
    headers: &HashMap<String, String>,
) -> Option<String> {
    if let Some(token) = &config.token {
        return Some(token.clone());
    }

    headers
        .get("authorization")
        .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw).to_string())
        .filter(|token| !token.is_empty())
}
