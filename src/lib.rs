//! Azure OpenAI Gateway 库模块
//!
//! 提供 OpenAI 接口到 Azure OpenAI 部署的转发服务核心功能，包括：
//! - 配置管理
//! - 后端 HTTP 客户端
//! - 流式响应重组
//! - 批量 embeddings 并发聚合
//! - 错误处理和追踪
//! - 指标收集

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod error_tracking;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod reframe;
pub mod tracing_util;
