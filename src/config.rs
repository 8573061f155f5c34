use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::env;

pub const DEFAULT_API_VERSION: &str = "2023-03-15-preview";

// 内置映射，可被 AZURE_OPENAI_MODEL_MAPPER 覆盖
const BUILTIN_DEPLOYMENTS: &[(&str, &str)] = &[("gpt-3.5-turbo", "gpt35"), ("gpt-4", "gpt4")];

// 简化的网关配置结构，启动时构造一次，之后只读
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_version: String,
    pub token: Option<String>,
    pub deployment_mapping: HashMap<String, String>,
    pub port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let endpoint = env::var("AZURE_OPENAI_ENDPOINT")
            .map_err(|_| GatewayError::Config("AZURE_OPENAI_ENDPOINT must be set".to_string()))?;
        let api_version = env::var("AZURE_OPENAI_API_VER")
            .unwrap_or_else(|_| DEFAULT_API_VERSION.to_string());
        let mapper = env::var("AZURE_OPENAI_MODEL_MAPPER").unwrap_or_default();
        let token = env::var("AZURE_OPENAI_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        let port = env::var("GATEWAY_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or_else(default_port);

        Ok(Self::new(&endpoint, &api_version, token, &mapper, port))
    }

    pub fn new(
        endpoint: &str,
        api_version: &str,
        token: Option<String>,
        mapper: &str,
        port: u16,
    ) -> Self {
        Self {
            endpoint: normalized_endpoint(endpoint),
            api_version: api_version.to_string(),
            token,
            deployment_mapping: parse_deployment_mapping(mapper),
            port,
        }
    }

    /// Backend deployment name for a client-facing model identifier.
    /// Unrecognized identifiers pass through unchanged.
    pub fn deployment_for(&self, model: &str) -> String {
        self.deployment_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn backend_url(&self, deployment: &str, resource: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.endpoint, deployment, resource, self.api_version
        )
    }
}

// 默认端口函数
pub fn default_port() -> u16 {
    8000
}

pub fn parse_deployment_mapping(raw: &str) -> HashMap<String, String> {
    let mut mapping: HashMap<String, String> = BUILTIN_DEPLOYMENTS
        .iter()
        .map(|(model, deployment)| (model.to_string(), deployment.to_string()))
        .collect();

    for pair in raw.split(',') {
        if let Some((model, deployment)) = pair.split_once('=') {
            let model = model.trim();
            let deployment = deployment.trim();
            if !model.is_empty() && !deployment.is_empty() {
                mapping.insert(model.to_string(), deployment.to_string());
            }
        }
    }

    mapping
}

fn normalized_endpoint(base: &str) -> String {
    let trimmed = base.trim();
    let prefixed = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    prefixed.trim_end_matches('/').to_string()
}
