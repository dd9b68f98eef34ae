//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / 路由）

pub mod deepseek;
pub mod json;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, create_deepseek_router, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use json::{extract_json_object, strip_code_fence};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use router::{ModelCapabilities, ModelRouter, RoutingLlmClient, TaskClassifier, TaskType};
pub use traits::{Complexity, LlmClient, LlmError, LlmPolicy, JSON_ONLY_INSTRUCTION};

use crate::config::AppConfig;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = std::time::Duration::from_secs(cfg.llm.timeouts.request);
    if provider == "mock" {
        tracing::info!("Using Mock LLM (provider = mock)");
        return Arc::new(MockLlmClient::new());
    }

    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        if model == DEEPSEEK_CHAT {
            tracing::info!("Using DeepSeek LLM ({} + {} router)", DEEPSEEK_CHAT, DEEPSEEK_REASONER);
            return Arc::new(create_deepseek_router(timeout));
        }
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(create_deepseek_client(Some(&model), timeout))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(
            OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )
            .with_request_timeout(timeout),
        )
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}
