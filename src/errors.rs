use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("URL error: {0}")]
    Url(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Not allowed: {0}")]
    Auth(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// Short label used for the `upstream_errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Url(_) => "url",
            GatewayError::Io(_) => "io",
            GatewayError::Config(_) => "config",
            GatewayError::Json(_) => "json",
            GatewayError::Upstream(_) => "upstream",
            GatewayError::Tls(_) => "tls",
            GatewayError::Auth(_) => "auth",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
