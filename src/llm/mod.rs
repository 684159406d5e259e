//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, Message, Role};

use crate::config::LlmSection;

/// 按配置创建客户端：provider = "openai" 且有 API Key 时用 OpenAI 兼容端点，否则回退 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    match (cfg.provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!(model = %cfg.model, "using OpenAI-compatible client");
            let mut client = OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, Some(&key));
            if cfg.timeouts.request > 0 {
                client = client.with_request_timeout(Duration::from_secs(cfg.timeouts.request));
            }
            Arc::new(client)
        }
        ("openai", None) => {
            tracing::warn!("OPENAI_API_KEY not set, falling back to mock client");
            Arc::new(MockLlmClient)
        }
        _ => Arc::new(MockLlmClient),
    }
}
