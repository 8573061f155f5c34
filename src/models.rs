use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// OpenAI兼容的请求结构。只解析路由决策需要的字段；
// 转发时使用客户端原始字节，不做重序列化。
#[derive(Debug, Deserialize, Clone)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: EmbeddingInput,
}

/// The `input` field decides the forwarding path: a plain string is a single
/// pass-through call, an array fans out one backend call per element. Any
/// other JSON type is rejected at deserialization time.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<Value>),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u32,
    pub total_tokens: u32,
}

impl EmbeddingUsage {
    /// Plain addition: completion order never affects the totals.
    pub fn accumulate(&mut self, other: &EmbeddingUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Decoded body of one backend embeddings call. The entries in `data` stay
/// opaque maps so unrecognized backend fields survive the merge.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingSubResult {
    pub data: Vec<Map<String, Value>>,
    #[serde(default)]
    pub usage: EmbeddingUsage,
}

#[derive(Debug, Serialize, Clone)]
pub struct MergedEmbeddings {
    pub object: String,
    pub data: Vec<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: EmbeddingUsage,
}

impl MergedEmbeddings {
    pub fn empty() -> Self {
        Self {
            object: "list".to_string(),
            data: Vec::new(),
            model: None,
            usage: EmbeddingUsage::default(),
        }
    }
}

/// Static catalog served on `GET /v1/models`.
pub fn model_catalog() -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": "gpt-3.5-turbo",
            "object": "model",
            "created": 1677610602,
            "owned_by": "openai",
            "permission": [{
                "id": "modelperm-M56FXnG1AsIr3SXq8BYPvXJA",
                "object": "model_permission",
                "created": 1679602088,
                "allow_create_engine": false,
                "allow_sampling": true,
                "allow_logprobs": true,
                "allow_search_indices": false,
                "allow_view": true,
                "allow_fine_tuning": false,
                "organization": "*",
                "group": null,
                "is_blocking": false
            }],
            "root": "gpt-3.5-turbo",
            "parent": null
        }]
    })
}
